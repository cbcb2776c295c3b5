mod accounts;

pub use accounts::{Account, AccountError, AccountStore, NewAccount};
