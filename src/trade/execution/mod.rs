pub mod gateway_box;
pub mod order_check;
