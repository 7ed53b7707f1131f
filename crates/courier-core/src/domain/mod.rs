//! Domain model (ids, task envelope, lease, outcome, callback record, states).

pub mod callback;
pub mod errors;
pub mod ids;
pub mod lease;
pub mod outcome;
pub mod state;
pub mod task;

pub use callback::CallbackRecord;
pub use errors::{ErrorKind, TaskError};
pub use ids::{BusinessId, MessageId, ParseIdError, WorkerId};
pub use lease::Lease;
pub use outcome::{ExecutionOutcome, OutcomeKind};
pub use state::{MessageState, TaskStatus};
pub use task::{ContentType, LeasedMessage, MessageBody, TaskEnvelope, TaskType};
