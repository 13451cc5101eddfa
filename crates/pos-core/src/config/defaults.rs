//! Default value functions used by serde for config deserialization.

pub fn default_name() -> String {
    "POS".to_string()
}

pub fn default_data_dir() -> String {
    "~/.pos".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_timezone() -> String {
    "UTC".to_string()
}

pub fn default_true() -> bool {
    true
}

pub fn default_db_path() -> String {
    "~/.pos/data/pos.db".to_string()
}

pub fn default_max_connections() -> u32 {
    4
}

pub fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

pub fn default_api_port() -> u16 {
    8000
}

pub fn default_cache_capacity() -> usize {
    1024
}

pub fn default_avatars() -> Vec<String> {
    ["Warrior", "Businessman", "Scholar", "Artist", "Monk"]
        .into_iter()
        .map(String::from)
        .collect()
}
