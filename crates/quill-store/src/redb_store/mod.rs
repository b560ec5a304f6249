mod store;
mod transaction;

pub use store::RedbStore;
pub use transaction::RedbTransaction;
