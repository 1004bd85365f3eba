//! HTTP handlers for the keystash API.

pub mod containers;
pub mod health;
pub mod orders;
pub mod secret_stores;
pub mod secrets;

pub use containers::{delete_container_handler, get_container_handler, list_containers_handler};
pub use health::health_handler;
pub use orders::create_order_handler;
pub use secret_stores::{
    get_global_default_handler, get_preferred_handler, get_secret_store_handler,
    list_secret_stores_handler, set_preferred_handler, unset_preferred_handler,
};
pub use secrets::{
    create_secret_handler, delete_secret_handler, get_secret_handler, get_secret_payload_handler,
    list_secrets_handler, put_secret_payload_handler,
};
