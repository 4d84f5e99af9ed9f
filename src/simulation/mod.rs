// Simulation Module
// Local exchange stand-in for paper trading and tests

pub mod paper_exchange;

pub use paper_exchange::PaperExchange;
