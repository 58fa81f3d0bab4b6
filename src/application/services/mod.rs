pub mod farm_service;
