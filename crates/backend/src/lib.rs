//! # Backend — query facade over the History Tree
//!
//! [`HistoryTreeBackend`] is what a state system talks to: it inserts state
//! intervals, seals the history with
//! [`finished_building`](HistoryTreeBackend::finished_building) and answers
//! point queries by walking the tree from the root down to the node whose time
//! range holds the query time.
//!
//! [`ThreadedHistoryTreeBackend`] wraps it with a bounded queue and a dedicated
//! mutation thread, so producers only block when the queue is full.
//!
//! ```no_run
//! use backend::{HistoryTreeBackend, HtConfig, Value};
//!
//! # fn main() -> Result<(), backend::HistoryError> {
//! let backend = HistoryTreeBackend::new(HtConfig::new("/tmp/state.ht", 1, 0))?;
//! backend.insert_past_state(0, 99, 1, Value::Int(5))?;
//! backend.finished_building(100)?;
//! assert_eq!(backend.do_singular_query(42, 1)?.value(), &Value::Int(5));
//! # Ok(())
//! # }
//! ```

mod backend;
mod threaded;

pub use backend::HistoryTreeBackend;
pub use threaded::{ThreadedHistoryTreeBackend, DEFAULT_QUEUE_SIZE};

pub use htree::{ExpectedProvider, HistoryError, HtConfig};
pub use interval::{Interval, Timestamp, Value};
