pub mod accounts;
pub mod config;
pub mod credentials;
pub mod db;
pub mod entitlements;
pub mod events;
pub mod export;
pub mod gateway;
pub mod model;
pub mod realtime;
pub mod services;
pub mod session;
pub mod supabase;
