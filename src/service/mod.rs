pub mod payment_service;
pub mod upstream;

pub use payment_service::{PaymentError, PaymentReceipt, PaymentRequest, PaymentService};
