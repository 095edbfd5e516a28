fn main() -> std::process::ExitCode {
    stagehand::run()
}
