//! Registry V2 pull engine for wharf.
//!
//! Pulls a container image from a Docker/OCI-compatible registry using
//! plain Registry V2 HTTP calls and assembles the result into a tarball
//! loadable with `docker load`. The stages:
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐   ┌────────────┐
//! │ AuthSession│──▶│ resolve      │──▶│ BlobFetcher │──▶│ ImagePacker│
//! │ /v2/ probe │   │ manifest(s)  │   │ per digest  │   │ legacy tar │
//! └────────────┘   └──────────────┘   └─────────────┘   └────────────┘
//! ```
//!
//! The [`ImagePuller`] orchestrates one pull operation end to end; every
//! other module is usable on its own.

pub mod auth;
pub mod blob;
pub mod digest;
pub mod manifest;
pub mod pack;
pub mod pull;
pub mod reference;

pub use auth::{AuthChallenge, AuthSession};
pub use blob::{BlobFetcher, FetchedBlob};
pub use digest::{Algorithm, Digest, DigestHasher};
pub use manifest::{Descriptor, ImageManifest, ManifestList, ResolvedManifest};
pub use pack::{ImagePacker, PackedImage};
pub use pull::ImagePuller;
pub use reference::ImageReference;
