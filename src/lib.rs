pub mod address;
pub mod annotation;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod milter;
pub mod oracle;
pub mod transaction;
pub mod verdict;
pub mod whitelist;

pub use cache::ResultCache;
pub use config::Config;
pub use milter::Milter;
pub use oracle::{MailAuthOracle, SpfOracle};
pub use transaction::{Disposition, PolicyEngine, Transaction};
pub use verdict::SpfVerdict;
pub use whitelist::Whitelist;
