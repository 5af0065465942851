mod backward;
mod forward;
mod layouts;

pub use backward::{BackwardPlan, BackwardSetup};
pub use forward::{
    AppendPlan, EpilogueDestination, ForwardPlan, ForwardSetup, KeyAddressing,
    PageTable, RotaryTables,
};
pub use layouts::{AccumLayout, LseLayout, OutputLayout};
