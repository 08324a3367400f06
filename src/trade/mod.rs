pub mod execution;
pub mod gateway;
pub mod sizing;

#[cfg(test)]
pub(crate) mod mock_gateway;
