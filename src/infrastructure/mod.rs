pub mod context;
pub mod correlation;
pub mod emitter;
pub mod interceptor;
pub mod logging;
pub mod masking;
pub mod propagation;
