//! Durable snapshot storage for resource records.
//!
//! One file per resource under the data directory, either plaintext JSON or
//! an encryption envelope. Writes go through a temp file and `rename`, and
//! are guarded by a non-blocking per-resource lock from `idrs-lock`.

pub mod cipher;
pub mod dirty;
pub mod envelope;
pub mod snapshot;

pub use cipher::{AesGcmCipher, Cipher, Sealed};
pub use dirty::DirtySet;
pub use envelope::Envelope;
pub use snapshot::{PersistOutcome, SnapshotStore};
