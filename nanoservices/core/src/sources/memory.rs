use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;
use parrot_utils::error::Error;
use parrot_utils::{ChangeEvent, ChangeStream, ParrotResult, SourceOffset};
use tokio::sync::watch;

use crate::model::SourceConfig;
use crate::sources::traits::SourceProvider;

struct TopicLog {
    events: Mutex<Vec<ChangeEvent>>,
    appended: watch::Sender<usize>,
}

impl TopicLog {
    fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self { events: Mutex::new(Vec::new()), appended }
    }

    fn get(&self, index: usize) -> ParrotResult<Option<ChangeEvent>> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::Transport("change log lock poisoned".into()))?;
        Ok(events.get(index).cloned())
    }
}

/// In-process append-only change log, one sequence per topic.
///
/// Offsets start at 1 and increase by one per appended event.
#[derive(Default)]
pub struct MemoryChangeLog {
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> ParrotResult<Arc<TopicLog>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| Error::Transport("change log lock poisoned".into()))?;
        Ok(topics.entry(name.to_string()).or_insert_with(|| Arc::new(TopicLog::new())).clone())
    }

    /// Append `event` to `topic`; its offset is overwritten with the next one.
    pub fn append(&self, topic: &str, mut event: ChangeEvent) -> ParrotResult<SourceOffset> {
        let log = self.topic(topic)?;
        let offset = {
            let mut events = log
                .events
                .lock()
                .map_err(|_| Error::Transport("change log lock poisoned".into()))?;
            let offset = SourceOffset(events.len() as u64 + 1);
            event.offset = offset;
            events.push(event);
            offset
        };
        log.appended.send_modify(|count| *count += 1);
        Ok(offset)
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topic(topic)
            .ok()
            .and_then(|log| log.events.lock().ok().map(|events| events.len()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceProvider for MemoryChangeLog {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self, source: &SourceConfig, after: Option<SourceOffset>) -> ParrotResult<ChangeStream> {
        let log = self.topic(&source.topic)?;
        let rx = log.appended.subscribe();
        let start = after.map(|o| o.0 as usize).unwrap_or(0);

        let events = stream::unfold((log, rx, start), |(log, mut rx, next)| async move {
            loop {
                rx.borrow_and_update();
                match log.get(next) {
                    Ok(Some(event)) => return Some((Ok(event), (log, rx, next + 1))),
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), (log, rx, next))),
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use parrot_utils::Operation;
    use std::time::Duration;

    fn event(table: &str) -> ChangeEvent {
        ChangeEvent {
            op: Operation::Insert,
            table: table.into(),
            key: vec!["id".into()],
            fields: vec![],
            offset: SourceOffset(0),
        }
    }

    fn source(topic: &str) -> SourceConfig {
        SourceConfig { topic: topic.into(), properties: Default::default() }
    }

    #[tokio::test]
    async fn offsets_are_sequential_per_topic() {
        let log = MemoryChangeLog::new();
        assert_eq!(log.append("a", event("t")).unwrap(), SourceOffset(1));
        assert_eq!(log.append("a", event("t")).unwrap(), SourceOffset(2));
        assert_eq!(log.append("b", event("t")).unwrap(), SourceOffset(1));
        assert_eq!(log.len("a"), 2);
    }

    #[tokio::test]
    async fn resumes_strictly_after_offset() {
        let log = MemoryChangeLog::new();
        for _ in 0..3 {
            log.append("a", event("t")).unwrap();
        }
        let mut stream = log.open(&source("a"), Some(SourceOffset(2))).await.unwrap();
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.offset, SourceOffset(3));
    }

    #[tokio::test]
    async fn waits_for_new_events() {
        let log = Arc::new(MemoryChangeLog::new());
        let mut stream = log.open(&source("a"), None).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(30), stream.next()).await;
        assert!(pending.is_err());

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append("a", event("t")).unwrap();
        });
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(next.offset, SourceOffset(1));
    }
}
