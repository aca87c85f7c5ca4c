pub mod warehouse;

pub use warehouse::{ReservationError, StockReservation, WarehouseClient};
