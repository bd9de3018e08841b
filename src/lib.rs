// Token encryption and key management
pub mod crypto;

// Non-secret token attributes bound as AAD
pub mod metadata;

// Credential records, rotation policy and lifecycle
pub mod credentials;

// Platform OAuth refresh collaborator
pub mod refresh;

// Bearer-token caller resolution
pub mod auth;

// HTTP API
pub mod api;

// Service configuration
pub mod config;
