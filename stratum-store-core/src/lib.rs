pub mod base32;
pub mod derivation;
pub mod hash;
pub mod signature;
pub mod signing;
pub mod store_path;

pub use derivation::{is_derivation, Derivation, DerivationError, StateOutput};
pub use hash::{Hash, HashAlgo, HashSink, ParseHashError};
pub use signature::{PathSignature, PublicKey, SignatureError};
pub use signing::{SigningError, SigningKey};
pub use store_path::{calling_username, check_store_name, PathNameError, StoreDirs};
