fn main() -> std::process::ExitCode {
    flearn_lib::run()
}
