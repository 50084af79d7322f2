pub mod ownership;
pub mod scheduling_config;
pub mod workload_cache;
pub mod informer;
pub mod decision;
pub mod pod_mutation;
pub mod validation;
pub mod webhook_server;
