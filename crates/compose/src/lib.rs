pub mod catalog;
pub mod controller;

pub use catalog::{DirectoryCatalog, StackCatalog};
pub use controller::{ComposeConfig, ComposeController, StackController, StackError, StackOp};
