use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use parrot_core::cluster::{CoordinationBackend, MemoryBackend};
use parrot_core::control::{server, ControlPlane, ControlPlaneClient, ProcessorService};
use parrot_core::model::{DesiredState, DialectConfig, LifecycleState, ProcessorDefinition, SinkConfig, SourceConfig};
use parrot_core::store::Registry;
use parrot_utils::error::{Error, ErrorKind};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Served {
    client: ControlPlaneClient,
    backend: Arc<MemoryBackend>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

fn serve() -> Served {
    let registry = Arc::new(Registry::in_memory().unwrap());
    let backend = Arc::new(MemoryBackend::new());
    let service = ProcessorService::new(registry, backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = server::serve_with_shutdown(listener, Arc::new(service), async move {
        let _ = stopped.await;
    });
    let client = ControlPlaneClient::new(&format!("http://{addr}/")).unwrap();
    Served { client, backend, stop, task }
}

fn definition(id: &str) -> ProcessorDefinition {
    ProcessorDefinition {
        id: id.into(),
        description: Some("orders into the warehouse".into()),
        source: SourceConfig { topic: "dbserver1.sales.orders".into(), properties: Default::default() },
        sink: SinkConfig {
            database: "sales".into(),
            dialect: DialectConfig::Impala {
                hostname: "impala.local".into(),
                port: 21050,
                username: "etl".into(),
                password: "secret".into(),
            },
        },
        desired_state: DesiredState::Stopped,
        restart_generation: 0,
    }
}

#[tokio::test]
async fn commands_round_trip_over_http() {
    let served = serve();
    let client = &served.client;

    assert!(client.list_processors().await.unwrap().is_empty());
    let added = client.add_processor(definition("orders")).await.unwrap();
    assert_eq!(added, definition("orders"));
    assert_eq!(client.list_processors().await.unwrap(), vec!["orders".to_string()]);
    assert_eq!(client.get_processor("orders").await.unwrap(), definition("orders"));

    let started = client.start_processor("orders").await.unwrap();
    assert_eq!(started.desired_state, DesiredState::Running);

    let mut table = served.backend.load_assignments().await.unwrap();
    table.assign("orders", "n1".into()).unwrap();
    served.backend.store_assignments(table.version, table).await.unwrap();
    let view = client.processor_cluster("orders").await.unwrap();
    assert_eq!(view.len(), 1);
    assert!(view[0].owner);
    assert_eq!(view[0].state, LifecycleState::Created);

    let restarted = client.restart_processor("orders").await.unwrap();
    assert_eq!(restarted.restart_generation, 1);

    let stopped = client.stop_processor("orders").await.unwrap();
    assert_eq!(stopped.desired_state, DesiredState::Stopped);
    client.delete_processor("orders").await.unwrap();
    assert!(client.list_processors().await.unwrap().is_empty());

    let _ = served.stop.send(());
    tokio::time::timeout(Duration::from_secs(2), served.task).await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_add_surfaces_remote_message() {
    let served = serve();
    served.client.add_processor(definition("orders")).await.unwrap();

    let err = served.client.add_processor(definition("orders")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);
    assert!(err.to_string().contains("processor 'orders' already exists"), "{err}");

    let mut invalid = definition("bad/id");
    invalid.id = "bad/id".into();
    let err = served.client.add_processor(invalid).await.unwrap_err();
    assert!(matches!(err, Error::Domain { .. }));
}

#[tokio::test]
async fn other_failures_are_transport_errors() {
    let served = serve();
    served.client.add_processor(definition("orders")).await.unwrap();
    served.client.start_processor("orders").await.unwrap();

    let err = served.client.delete_processor("orders").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.to_string().contains("409"), "{err}");

    let err = served.client.get_processor("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn accepted_ids_are_addressable_over_http() {
    let served = serve();
    let client = &served.client;

    let id = "sales.orders-2024_v1";
    client.add_processor(definition(id)).await.unwrap();
    assert_eq!(client.get_processor(id).await.unwrap().id, id);
    assert_eq!(client.start_processor(id).await.unwrap().desired_state, DesiredState::Running);
    assert_eq!(client.restart_processor(id).await.unwrap().restart_generation, 1);
    assert!(client.processor_cluster(id).await.unwrap().is_empty());
    client.stop_processor(id).await.unwrap();
    client.delete_processor(id).await.unwrap();

    let err = client.add_processor(definition("sales orders")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Domain);
    assert!(err.to_string().contains("may only contain"), "{err}");
    assert!(client.list_processors().await.unwrap().is_empty());
}
