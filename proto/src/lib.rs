//! Wire types shared between the HierarchiDB worker core and its callers.
//!
//! Everything here is plain data: branded ids, the node/tree records, the
//! command envelope, and the change-event shape. No storage or policy logic
//! lives in this crate; see `hierarchidb-core` for that.

pub mod command;
pub mod error;
pub mod event;
pub mod id;
pub mod name;
pub mod node;
pub mod working_copy;

pub use command::{CommandEnvelope, CommandKind, CommandResult, ErrorCode, OnNameConflict};
pub use error::DecodeError;
pub use event::{ChangeEvent, ChangeEventKind};
pub use id::{CommandGroupId, CommandId, EntityId, NodeId, Seq, SubscriptionId, TreeId, WorkingCopyId};
pub use node::{ClipboardData, ClipboardKind, DescendantSummary, Node, NodeBundle, RootKind, Tree, TrashStamp, WorkingCopyStamp};
pub use working_copy::WorkingCopy;
