use anyhow::Result;
use clap::Parser;
use grader::config::Config;

#[derive(Parser)]
#[command(
    name = "grader",
    about = "evaluation harness for generative language models"
)]
pub enum Grader {
    /// Run the API server with the embedded task runner
    Server,
    /// Validate the configuration file
    CheckConfig {
        /// Path of the configuration file to check
        #[arg(long)]
        file: Option<String>,
    },
}

impl Grader {
    pub fn run(self) -> Result<()> {
        match self {
            Grader::Server => {
                let config = Config::load()?;
                grader::server::run(config)
            }
            Grader::CheckConfig { file } => Config::check(&file),
        }
    }
}
