// Entity Models
//
// Each entity has a stable UUID identity and a store-backed registry for
// lookups. Profiles resolve external telegram identities; collectibles
// carry the sellable item's metadata and current owner.

pub mod collectible;
pub mod profile;

pub use collectible::{Collectible, CollectibleRegistry, MediaKind};
pub use profile::{Profile, ProfileDirectory, TelegramIdentity};
