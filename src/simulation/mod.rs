//! Response simulation: cell execution, reply parsing and the driver that
//! runs the persona × model × condition × instrument cross product.

pub mod cell;
pub mod control;
pub mod driver;
pub mod parser;

pub use cell::{run_cell, CellInput};
pub use control::RunControl;
pub use driver::{RunReport, SimulationDriver};
pub use parser::{parse_single, parse_turn};
