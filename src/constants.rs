// src/constants.rs

/// Attribute the parser leaves in markup where an event-bound command was declared.
pub const PLACEHOLDER_ATTRIBUTE: &str = "data-queueable";

/// Origin recorded for memory written through the direct API.
pub const USER_ORIGIN: &str = "User";

/// Origin recorded for loop slots written by the template expander.
pub const TEMPLATE_ORIGIN: &str = "Template";

/// Origin recorded for the boot file's cache seed.
pub const CONFIG_ORIGIN: &str = "Config";

/// Default cookie prefix. The index cookie is `<prefix>INDEX`, each slot `<prefix><name>`.
pub const DEFAULT_COOKIE_PREFIX: &str = "OT_";

/// Suffix of the index cookie name.
pub const COOKIE_INDEX_SUFFIX: &str = "INDEX";

/// Rolling expiry of persisted memory cookies.
pub const DEFAULT_COOKIE_EXPIRY_DAYS: u64 = 7;
/// Longest cookie lifetime accepted from configuration, matching what browsers honour.
pub const MAX_COOKIE_EXPIRY_DAYS: u64 = 400;

/// Default delay before a ready command's plugin method is invoked.
pub const DEFAULT_DISPATCH_DELAY_MS: u64 = 10;

/// Number of console diagnostics kept in memory.
pub const DEFAULT_CONSOLE_HISTORY: usize = 512;

/// Number of errored chains kept for inspection before the oldest are dropped.
pub const DEFAULT_RETAINED_ERRORS: usize = 64;

/// Prepared queue executed when a plugin reports a transport failure.
pub const DEFAULT_ERROR_QUEUE: &str = "error";

/// Prepared queue executed once boot has flushed every template.
pub const INIT_QUEUE: &str = "init";

/// Name of the engine configuration file.
pub const ENGINE_CONFIG_FILENAME: &str = "queueable.toml";

/// Name of the cookie jar file used by the CLI.
pub const COOKIE_JAR_FILENAME: &str = "cookies.bin";

/// Root element boot templates are flushed into.
pub const BODY_SELECTOR: &str = "body";
