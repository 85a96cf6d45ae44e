//! Migration engine
//!
//! ```text
//! MigrationDriver
//!   ├── MembershipSync ────────┐
//!   ├── FundingCoordinator ────┤
//!   ├── MigrationScheduler     ├── NonceSequencer (per chain) ── Ledger
//!   │     └── AmountResolver   │
//!   └── TransferWorkerPool ────┘
//!         └── ProgressLedger
//! ```

pub mod driver;
pub mod funding;
pub mod nonce;
pub mod progress;
pub mod report;
pub mod resolver;
pub mod scheduler;
pub mod sync;
pub mod types;
pub mod worker;

pub use driver::MigrationDriver;
pub use funding::FundingCoordinator;
pub use nonce::NonceSequencer;
pub use progress::ProgressLedger;
pub use report::MigrationReport;
pub use resolver::AmountResolver;
pub use scheduler::MigrationScheduler;
pub use types::{Account, Amount, Chain, TransferRecord};
pub use worker::TransferWorkerPool;
