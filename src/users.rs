//! uid/gid to name resolution from passwd/group style files

use fnv::FnvHashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

/// Overrides the passwd file location
pub const ENV_PASSWD_PATH: &str = "PTSENTRY_PASSWD_PATH";

/// Overrides the group file location
pub const ENV_GROUP_PATH: &str = "PTSENTRY_GROUP_PATH";

const DEFAULT_PASSWD_PATH: &str = "/etc/passwd";
const DEFAULT_GROUP_PATH: &str = "/etc/group";

/// Where user and group databases are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDbPaths {
    pub passwd: PathBuf,
    pub group: PathBuf,
}

impl Default for UserDbPaths {
    fn default() -> Self {
        Self {
            passwd: PathBuf::from(DEFAULT_PASSWD_PATH),
            group: PathBuf::from(DEFAULT_GROUP_PATH),
        }
    }
}

impl UserDbPaths {
    /// Defaults, with non-empty environment overrides applied
    pub fn from_env() -> Self {
        let mut paths = Self::default();
        if let Some(path) = std::env::var_os(ENV_PASSWD_PATH).filter(|p| !p.is_empty()) {
            paths.passwd = PathBuf::from(path);
        }
        if let Some(path) = std::env::var_os(ENV_GROUP_PATH).filter(|p| !p.is_empty()) {
            paths.group = PathBuf::from(path);
        }
        paths
    }
}

/// Parse `name:x:id:...` lines into an id -> name map.
///
/// First entry wins on duplicate ids. Comments and malformed lines are skipped.
pub fn parse_db(content: &str) -> FnvHashMap<u32, String> {
    let mut map = FnvHashMap::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        let (Some(name), Some(_), Some(id)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(id) = id.parse::<u32>() {
            map.entry(id).or_insert_with(|| name.to_string());
        }
    }
    map
}

/// Lazily loaded user and group tables, shared by the trace loop and the
/// proc scanner
#[derive(Debug, Default)]
pub struct UserDb {
    paths: UserDbPaths,
    users: OnceLock<FnvHashMap<u32, String>>,
    groups: OnceLock<FnvHashMap<u32, String>>,
}

fn load(path: &PathBuf) -> FnvHashMap<u32, String> {
    match fs::read_to_string(path) {
        Ok(content) => parse_db(&content),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unable to read id database");
            FnvHashMap::default()
        }
    }
}

impl UserDb {
    pub fn new(paths: UserDbPaths) -> Self {
        Self {
            paths,
            users: OnceLock::new(),
            groups: OnceLock::new(),
        }
    }

    pub fn paths(&self) -> &UserDbPaths {
        &self.paths
    }

    pub fn user_name(&self, uid: u32) -> Option<String> {
        self.users
            .get_or_init(|| load(&self.paths.passwd))
            .get(&uid)
            .cloned()
    }

    pub fn group_name(&self, gid: u32) -> Option<String> {
        self.groups
            .get_or_init(|| load(&self.paths.group))
            .get(&gid)
            .cloned()
    }
}
