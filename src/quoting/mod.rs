// Quoting engine entrypoint
pub mod converge; // diff desired ladder against open orders
pub mod ladder;   // desired ladder math + position gating
pub mod manager;  // driver loop, health checks, unwind
