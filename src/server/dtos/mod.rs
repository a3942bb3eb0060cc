pub mod doh_dto;
pub mod health_dto;
