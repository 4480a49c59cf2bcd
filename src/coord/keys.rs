pub const JOB_SAVE_DIR: &str = "/cron/jobs/";
pub const JOB_KILLER_DIR: &str = "/cron/killer/";
pub const JOB_LOCK_DIR: &str = "/cron/lock/";
pub const JOB_WORKER_DIR: &str = "/cron/workers/";

pub fn job_key(name: &str) -> String {
    format!("{JOB_SAVE_DIR}{name}")
}

pub fn killer_key(name: &str) -> String {
    format!("{JOB_KILLER_DIR}{name}")
}

pub fn lock_key(name: &str) -> String {
    format!("{JOB_LOCK_DIR}{name}")
}

pub fn worker_key(addr: &str) -> String {
    format!("{JOB_WORKER_DIR}{addr}")
}

/// `/cron/jobs/job10` -> `job10`
pub fn extract_job_name(key: &str) -> &str {
    key.strip_prefix(JOB_SAVE_DIR).unwrap_or(key)
}

/// `/cron/killer/job10` -> `job10`
pub fn extract_killer_name(key: &str) -> &str {
    key.strip_prefix(JOB_KILLER_DIR).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(job_key("ping"), "/cron/jobs/ping");
        assert_eq!(killer_key("ping"), "/cron/killer/ping");
        assert_eq!(lock_key("ping"), "/cron/lock/ping");
        assert_eq!(worker_key("10.0.0.1"), "/cron/workers/10.0.0.1");
    }

    #[test]
    fn extract_names() {
        assert_eq!(extract_job_name("/cron/jobs/job10"), "job10");
        assert_eq!(extract_killer_name("/cron/killer/job10"), "job10");
        assert_eq!(extract_job_name("job10"), "job10");
    }
}
