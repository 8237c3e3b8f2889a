mod delivery;
mod isolation;
mod ownership;
mod rebalance;
mod routing;
