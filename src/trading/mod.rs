pub mod executor;
pub mod portfolio;
pub mod quantize;
pub mod rebalance;

#[cfg(test)]
pub(crate) mod testkit;
