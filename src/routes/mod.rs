pub mod distances;
pub mod health;
pub mod stations;
