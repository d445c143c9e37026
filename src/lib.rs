mod app;
pub mod auth;
pub mod http;
pub mod navigation;
pub mod push;
pub mod redact;
pub mod session;
pub mod settings;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub fn run() -> std::process::ExitCode {
    app::run()
}
