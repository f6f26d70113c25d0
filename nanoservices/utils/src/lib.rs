pub mod error;
pub mod event;

use error::Error;
use futures_util::Stream;
use std::pin::Pin;

pub use event::{ChangeEvent, Field, FieldType, FieldValue, Operation, SourceOffset};

pub type ParrotResult<T> = Result<T, Error>;

/// Ordered stream of change events for one processor.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ParrotResult<ChangeEvent>> + Send>>;
