//! Request, record and outcome types shared by every stage.

pub mod outcome;
pub mod record;
pub mod request;

pub use outcome::{TestOutcome, TestStatus};
pub use record::{InputRecord, OutputRecord, RecordError};
pub use request::{default_clone_url, EvaluationRequest, RepositoryRef};
