/**
 * Key types.
 *  - Public keys identifying logs, and their
 *    discovery keys used as network topics
 *  - Secret keys, including per-name derivation
 */
pub mod crypto;
/**
 * Events reported while a rehoster runs.
 */
pub mod events;
/**
 * The replication graph: one ref-counted node
 *  per reachable key, following keyed indexes
 *  into their children.
 */
pub mod graph;
/**
 * Keyed index over an append-only log.
 *  Versioned, diffable, with a header block
 *  that tells indexes apart from plain logs.
 */
pub mod index;
/**
 * Append-only replicated logs and the store
 *  that opens them.
 */
pub mod log;
pub mod rehoster;
/**
 * Durable rehost set: public keys and their
 *  entries, kept in a keyed index.
 */
pub mod store;
/**
 * Topic-based overlay network, and the
 *  ref-counted membership layered on it.
 */
pub mod swarm;
pub mod testkit;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::crypto::{DiscoveryKey, PublicKey, SecretKey};
    pub use crate::events::RehostEvent;
    pub use crate::log::{LocalLogStore, LogStore, ReplicatedLog};
    pub use crate::rehoster::{Rehoster, RehosterConfig, RehosterError};
    pub use crate::store::{DesiredState, RehostEntry, RehostValue, SyncOutcome};
    pub use crate::swarm::{MemoryNetwork, Swarm};
    pub use crate::version::build_info;
}
