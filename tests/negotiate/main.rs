mod common;
mod config;
mod kerberos;
mod lifecycle;
mod protection;
mod providers;
mod spnego;
