pub mod state_flow;
