//! The UUCP endpoint core: link protocols (from the `codec` crate) plus
//! the transfer manager and pre-protocol dialogue that drive them.

pub mod cmd;
pub mod config;
pub mod grade;
pub mod manager;
pub mod mux;
pub mod session;
pub mod signals;
pub mod spool;
pub mod status;
pub mod transfer;

pub use config::{PeerConfig, ProtocolParams};
pub use manager::{Manager, Session};
pub use session::{dial, hangup_callee, hangup_caller, answer, AnswerOutcome, DialOutcome, Refusal};
pub use signals::Signals;
pub use spool::{ReceiveSink, Spool};
pub use status::{Status, StatusFile};
