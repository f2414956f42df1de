//! Everything that talks to the eID card through PKCS#11.

pub mod certificate;
pub mod controller;
pub mod cryptoki;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod module;
pub mod resolver;
pub mod session;

pub use self::certificate::CardCertificate;
pub use self::controller::{CardDeviceController, Slot};
pub use self::resolver::{SigningCertificate, TokenCertificate};
