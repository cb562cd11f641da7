//! Database module for PostgreSQL persistence.

mod invitations;
mod pool;
mod records;

pub use invitations::*;
pub use pool::*;
pub use records::*;
