//! スレッド管理機能

use crate::Result;

/// スレッドID（Linuxのtid）
pub type ThreadId = i32;

/// デバッグ対象のスレッド
pub struct Thread {
    tid: ThreadId,
}

impl Thread {
    /// スレッドを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self { tid }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// プロセスの全スレッドIDを列挙する
    pub fn list(pid: i32) -> Result<Vec<ThreadId>> {
        let task_dir = format!("/proc/{}/task", pid);
        let mut tids = Vec::new();
        for entry in std::fs::read_dir(&task_dir)? {
            let entry = entry?;
            if let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<ThreadId>().ok())
            {
                tids.push(tid);
            }
        }
        tids.sort_unstable();
        Ok(tids)
    }

    /// スレッドを停止させて停止を待つ
    pub fn suspend(&self) -> Result<()> {
        use nix::sys::wait::waitpid;
        let pid = nix::unistd::Pid::from_raw(self.tid);
        nix::sys::ptrace::interrupt(pid)?;
        waitpid(pid, None).map_err(crate::TargetError::Ptrace)?;
        Ok(())
    }

    /// スレッドの実行を再開する
    pub fn resume(&self) -> Result<()> {
        nix::sys::ptrace::cont(nix::unistd::Pid::from_raw(self.tid), None)?;
        Ok(())
    }
}
