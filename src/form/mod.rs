//! Form definition and submission validation.

pub mod schema;
pub mod validator;

pub use schema::{FieldType, FormFieldConfig, FormSchema, VerificationChannel};
pub use validator::FormValidator;
