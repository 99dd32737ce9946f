pub mod health_handlers;
pub mod multipart_handlers;
pub mod object_handlers;
