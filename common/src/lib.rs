// Pharos common library - main library exports

pub mod hash;
pub mod messages;
pub mod peer_error;
pub mod types;

// Flattened re-exports
pub use self::hash::{BlockId, Hash};
pub use self::peer_error::PeerErrorKind;
pub use self::types::*;
