pub mod serve;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the bridge server
    Serve(serve::Args),
}
