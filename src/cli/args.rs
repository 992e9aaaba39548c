// src/cli/args.rs
use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true)] // The command name is consumed by the registry.
pub struct RenderArgs {
    /// Path to the template file.
    pub template: String,

    /// Seed a Session memory slot before rendering (e.g. `user={"name":"Ada"}`).
    #[arg(long = "set", value_name = "NAME=JSON")]
    pub set: Vec<String>,

    /// Engine configuration file. Defaults to `~/.config/queueable/queueable.toml`.
    #[arg(long)]
    pub config: Option<String>,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true)]
pub struct ParseArgs {
    /// Path to the template file.
    pub template: String,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true)]
pub struct BootArgs {
    /// Path to the boot file.
    pub boot_file: String,

    /// Cookie jar holding Permanent memory. Defaults to `~/.config/queueable/cookies.bin`.
    #[arg(long)]
    pub cookies: Option<String>,

    /// Engine configuration file.
    #[arg(long)]
    pub config: Option<String>,

    /// How long to wait for running commands before printing the page.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[derive(Parser, Debug, Default)]
#[command(no_binary_name = true)]
pub struct CookiesArgs {
    /// Cookie jar to inspect.
    #[arg(long)]
    pub cookies: Option<String>,

    /// Engine configuration file (for the cookie prefix).
    #[arg(long)]
    pub config: Option<String>,

    /// Remove every cookie from the jar.
    #[arg(long)]
    pub clear: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_args_collect_repeated_sets() {
        let args = RenderArgs::try_parse_from(["page.html", "--set", "a=1", "--set", "b={}"]).unwrap();
        assert_eq!(args.template, "page.html");
        assert_eq!(args.set, vec!["a=1", "b={}"]);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_boot_args_defaults() {
        let args = BootArgs::try_parse_from(["boot.json"]).unwrap();
        assert_eq!(args.timeout_ms, 5000);
        assert!(BootArgs::try_parse_from(Vec::<String>::new()).is_err());
    }
}
