pub mod async_op;
pub mod promise;
