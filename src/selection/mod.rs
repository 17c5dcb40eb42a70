//! Input selection for new proposals

pub mod selector;

pub use selector::{FeeMode, Selection, SelectionParams, UtxoSelector};
