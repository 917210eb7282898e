//! `bundlerun` launcher
//!
//! Runs a program (direct mode) or an app bundle through the system `open`
//! tool (indirect mode), forwarding stdio and signals and exiting with the
//! program's exit code.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use bundlerun::{BundleTarget, Launcher};
use bundlerun_core::tracing_init::init_tracing;
use bundlerun_core::{EnvAccessor, LaunchMode, ProcessEnv, RelaunchConfig};

const DEBUG_ENV: &str = "BUNDLERUN_DEBUG";

#[derive(Parser, Debug)]
#[command(name = "bundlerun")]
#[command(
    version,
    about = "Relaunch a program inside its app bundle, forwarding stdio and signals"
)]
struct Args {
    /// Launch mode (overrides config and `BUNDLERUN_LAUNCH_MODE`)
    #[arg(long, value_parser = ["direct", "indirect"])]
    mode: Option<String>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Launch-indirection tool for indirect mode
    #[arg(long)]
    open_program: Option<PathBuf>,

    /// Executable inside the bundle (indirect mode). Defaults to
    /// `Contents/MacOS/<bundle name>`.
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Seconds between forwarding a termination signal and killing the
    /// child's process group
    #[arg(long)]
    terminate_grace: Option<u64>,

    /// Directory for the named pipes used in indirect mode
    #[arg(long)]
    pipe_dir: Option<PathBuf>,

    /// Do not forward signals to the child
    #[arg(long)]
    no_signals: bool,

    /// Do not ask the open tool for a fresh app instance
    #[arg(long)]
    reuse_instance: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "BUNDLERUN_LOG_JSON")]
    log_json: bool,

    /// Program to run (direct mode) or `.app` bundle (indirect mode)
    target: PathBuf,

    /// Arguments passed through to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

impl Args {
    fn resolve_config(&self, env: &dyn EnvAccessor) -> anyhow::Result<RelaunchConfig> {
        let mut config = match &self.config {
            Some(path) => RelaunchConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RelaunchConfig::default(),
        }
        .with_env_overrides(env);

        if let Some(mode) = &self.mode {
            config.mode = mode.parse::<LaunchMode>()?;
        }
        if let Some(open_program) = &self.open_program {
            config.open_program.clone_from(open_program);
        }
        if let Some(secs) = self.terminate_grace {
            config.terminate_grace_secs = secs;
        }
        if let Some(dir) = &self.pipe_dir {
            config.pipe_dir = Some(dir.clone());
        }
        if self.no_signals {
            config.forward_signals = false;
        }
        if self.reuse_instance {
            config.new_instance = false;
        }
        Ok(config)
    }

    /// The program that ends up running: the target itself, or the
    /// executable inside the bundle.
    fn program(&self, mode: LaunchMode) -> PathBuf {
        match mode {
            LaunchMode::Direct => self.target.clone(),
            LaunchMode::Indirect => self
                .executable
                .clone()
                .unwrap_or_else(|| BundleTarget::from_app(&self.target).executable),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let env = ProcessEnv;

    let filter = if env.flag(DEBUG_ENV) {
        "bundlerun=debug,bundlerun_core=debug"
    } else {
        "bundlerun=warn,bundlerun_core=warn"
    };
    init_tracing(filter, args.log_json);

    let config = args.resolve_config(&env)?;
    debug!(?config, target = %args.target.display(), "Resolved configuration");

    let program = args.program(config.mode);
    if !config.enabled {
        // Relaunching is switched off, so become the program in place.
        debug!(program = %program.display(), "Relaunch disabled, running in place");
        let err = Command::new(&program).args(&args.args).exec();
        return Err(err).with_context(|| format!("running {}", program.display()));
    }

    let launcher = Launcher::new(config);
    match launcher.config().mode {
        LaunchMode::Direct => launcher.launch_and_exit(&program, &args.args),
        LaunchMode::Indirect => launcher.relaunch(&args.target, &program, &args.args),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bundlerun_core::config::LAUNCH_MODE_ENV;
    use std::collections::HashMap;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("bundlerun").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn trailing_args_keep_their_dashes() {
        let args = parse(&["--mode", "direct", "/bin/ls", "-la", "--color"]);
        assert_eq!(args.target, PathBuf::from("/bin/ls"));
        assert_eq!(args.args, vec![OsString::from("-la"), OsString::from("--color")]);
    }

    #[test]
    fn cli_overrides_env() {
        let env: HashMap<String, String> =
            HashMap::from([(LAUNCH_MODE_ENV.to_string(), "indirect".to_string())]);

        let from_env = parse(&["/bin/true"]).resolve_config(&env).unwrap();
        assert_eq!(from_env.mode, LaunchMode::Indirect);

        let from_cli = parse(&[
            "--mode",
            "direct",
            "--terminate-grace",
            "2",
            "--no-signals",
            "/bin/true",
        ])
        .resolve_config(&env)
        .unwrap();
        assert_eq!(from_cli.mode, LaunchMode::Direct);
        assert_eq!(from_cli.terminate_grace_secs, 2);
        assert!(!from_cli.forward_signals);
    }

    #[test]
    fn program_follows_the_mode() {
        let args = parse(&["/Applications/Tool.app"]);
        assert_eq!(
            args.program(LaunchMode::Indirect),
            PathBuf::from("/Applications/Tool.app/Contents/MacOS/Tool")
        );
        assert_eq!(
            args.program(LaunchMode::Direct),
            PathBuf::from("/Applications/Tool.app")
        );

        let args = parse(&["--executable", "/opt/tool", "/Applications/Tool.app"]);
        assert_eq!(args.program(LaunchMode::Indirect), PathBuf::from("/opt/tool"));
    }

    #[test]
    fn disable_env_turns_relaunching_off() {
        let env: HashMap<String, String> = HashMap::from([(
            bundlerun_core::config::DISABLE_ENV.to_string(),
            "1".to_string(),
        )]);
        assert!(!parse(&["/bin/true"]).resolve_config(&env).unwrap().enabled);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Args::try_parse_from(["bundlerun", "--mode", "exec", "/bin/true"]).is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = parse(&["--config", "/nonexistent/bundlerun.json", "/bin/true"]);
        let env: HashMap<String, String> = HashMap::new();
        assert!(args.resolve_config(&env).is_err());
    }
}
