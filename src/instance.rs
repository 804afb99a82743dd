//! 单实例检查
//!
//! 同一个传输凭据（例如 socket 路径 / bot token）同时只允许一个 bridge 进程。
//! PID 文件名带凭据指纹，凭据本身不落盘。

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// 持有期间 PID 文件存在，Drop 时删除
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// 获取实例锁
    ///
    /// 已有存活进程时返回 `Error::Config`；残留的 PID 文件会被清理。
    pub fn acquire(data_dir: &Path, credential: &str) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = pid_path(data_dir, credential);

        if let Some(pid) = running_pid(&path) {
            return Err(Error::Config(format!("bridge 已在运行 (pid={})", pid)));
        }
        cleanup_stale_instance(&path)?;

        let pid = std::process::id();
        fs::write(&path, pid.to_string())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", path.display(), pid);

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// `<data_dir>/bridge-<指纹>.pid`
pub fn pid_path(data_dir: &Path, credential: &str) -> PathBuf {
    data_dir.join(format!("bridge-{}.pid", fingerprint(credential)))
}

fn fingerprint(credential: &str) -> String {
    let mut hasher = DefaultHasher::new();
    credential.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// PID 文件记录的进程仍存活时返回其 PID
pub fn running_pid(path: &Path) -> Option<i32> {
    let pid: i32 = fs::read_to_string(path).ok()?.trim().parse().ok()?;
    if pid <= 0 {
        return None;
    }
    is_alive(pid).then_some(pid)
}

/// 清理残留的 PID 文件
pub fn cleanup_stale_instance(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", path);
    }
    Ok(())
}

#[cfg(unix)]
fn is_alive(pid: i32) -> bool {
    // 信号 0 只做存在性检查
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn is_alive(_pid: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_path_depends_on_credential() {
        let dir = Path::new("/tmp/bridge");
        let a = pid_path(dir, "token-a");
        let b = pid_path(dir, "token-b");

        assert_ne!(a, b);
        assert_eq!(a, pid_path(dir, "token-a"));
        assert!(!a.to_string_lossy().contains("token-a"));
    }

    #[test]
    fn test_second_instance_is_rejected() {
        let dir = TempDir::new().unwrap();

        let lock = InstanceLock::acquire(dir.path(), "cred").unwrap();
        assert!(lock.path().exists());

        let second = InstanceLock::acquire(dir.path(), "cred");
        assert!(matches!(second, Err(Error::Config(_))));

        // 不同凭据互不影响
        let _other = InstanceLock::acquire(dir.path(), "other").unwrap();

        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = pid_path(dir.path(), "cred");
        // 不可能存在的 PID
        fs::write(&path, "999999999").unwrap();

        let lock = InstanceLock::acquire(dir.path(), "cred").unwrap();
        let recorded = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(recorded, std::process::id().to_string());
    }
}
