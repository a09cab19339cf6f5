pub mod bus;
pub mod deadline;
pub mod ids;
pub mod process_registry;
