//! 单实例文件锁
//!
//! 同一个 FPS 只允许一个控制进程。启动时在配置的路径上取排他锁，
//! 取不到即 `AlreadyRunning`。比 PID 探测可靠：进程崩溃后锁由
//! 操作系统自动释放。

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::debug;

use crate::error::{FpsError, Result};

/// 进程级单实例锁
///
/// Drop 时释放；锁文件本身保留在磁盘上。
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// 尝试获取排他锁（非阻塞）
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // 先不截断：锁还没拿到，文件可能属于活着的实例
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                FpsError::InvalidConfiguration(format!(
                    "cannot open lockfile {}: {}",
                    path.display(),
                    e
                ))
            })?;

        if !file.try_lock_exclusive().map_err(|e| {
            FpsError::InvalidConfiguration(format!("lockfile error: {}", e))
        })? {
            return Err(FpsError::AlreadyRunning);
        }

        // 拿到锁后清掉旧内容，写入当前 PID 便于排查
        file.set_len(0).ok();
        file.seek(SeekFrom::Start(0)).ok();
        writeln!(&file, "{}", std::process::id()).ok();
        file.sync_all().ok();

        debug!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // File 关闭时操作系统会释放锁；显式解锁只是把时序说清楚
        let _ = FileExt::unlock(&self.file);
    }
}
