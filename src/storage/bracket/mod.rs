#![forbid(unsafe_code)]
//! Bracket-encoded leaf storage.
//!
//! Nodes are stored as a verbatim low key followed by three-byte delta keys.
//! Navigation, insertion, deletion and splitting work directly on that
//! compressed form by replaying keys into a [`DeweyIdBuffer`].

pub mod id_buffer;
pub mod key;
pub mod maintenance;
pub mod navigation;
pub mod page;
pub mod sequence;
pub mod value;

pub use id_buffer::DeweyIdBuffer;
pub use key::{generate_keys, BracketKey, KeyType};
pub use maintenance::{DeleteApplied, DeleteEvent, DeleteOutcome, DeletePlan, SplitOutcome, SplitPoint, SubtreeRemainder};
pub use navigation::{NavigationMode, NavigationStatus, SearchMode};
pub use page::{BracketLeaf, InsertOutcome, LeafCursor, NodeSlot, Position, UpdateOutcome};
pub use sequence::NodeSequence;
pub use value::{OwnedValue, StoredValue};
