//! プロセス制御機能

use crate::{Result, TargetError};
use nix::sys::signal::Signal;
use std::ffi::CString;
use std::path::Path;

/// 停止イベントの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// ブレークポイントヒット（SIGTRAP）
    Breakpoint,
    /// ステップ実行完了（SIGTRAP）
    Step,
    /// シグナル受信
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// その他の停止
    Other,
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: nix::unistd::Pid,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
    /// 指定された実行可能ファイルをexecveで実行します。
    /// プロセスは最初の命令で停止状態で返されます。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::sys::ptrace;
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{execve, fork, ForkResult};

        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| TargetError::BadImage {
                path: program.as_ref().display().to_string(),
                reason: "path is not valid UTF-8".to_string(),
            })?;
        let program_cstring =
            CString::new(program_path).map_err(|e| TargetError::BadImage {
                path: program_path.to_string(),
                reason: e.to_string(),
            })?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str()).map_err(|e| {
                TargetError::BadImage {
                    path: program_path.to_string(),
                    reason: format!("invalid argument: {}", e),
                }
            })?);
        }

        // 環境変数は親プロセスから継承
        let env: Vec<CString> = std::env::vars()
            .filter_map(|(key, val)| CString::new(format!("{}={}", key, val)).ok())
            .collect();

        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                // 子プロセスがexecve後のSIGTRAPで停止するまで待機
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => Ok(Self { pid: child }),
                    status => Err(TargetError::Io(std::io::Error::other(format!(
                        "unexpected wait status after execve: {:?}",
                        status
                    )))),
                }
            }
            ForkResult::Child => {
                ptrace::traceme()?;
                // 成功すると戻ってこない
                execve(&program_cstring, &cstring_args, &env)?;
                unreachable!("execve failed");
            }
        }
    }

    /// 既存のプロセスにアタッチする
    ///
    /// PTRACE_SEIZEを使うため、アタッチ後もスレッド単位の
    /// interrupt/resumeが可能です。
    pub fn attach(pid: i32) -> Result<Self> {
        use nix::sys::ptrace;
        let pid = nix::unistd::Pid::from_raw(pid);
        ptrace::seize(pid, ptrace::Options::PTRACE_O_TRACECLONE)?;
        Ok(Self { pid })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// プロセスを実行継続する
    pub fn continue_execution(&self) -> Result<()> {
        nix::sys::ptrace::cont(self.pid, None)?;
        Ok(())
    }

    /// プロセスを実行継続して停止イベントを待機する
    pub fn continue_and_wait(&self) -> Result<StopReason> {
        nix::sys::ptrace::cont(self.pid, None)?;
        self.wait()
    }

    /// 1命令ステップ実行する
    pub fn step(&self) -> Result<StopReason> {
        nix::sys::ptrace::step(self.pid, None)?;
        self.wait()
    }

    /// 停止イベントを待機する
    pub fn wait(&self) -> Result<StopReason> {
        use nix::sys::wait::{waitpid, WaitStatus};

        let status = waitpid(self.pid, None)?;
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => Ok(StopReason::Breakpoint),
            WaitStatus::Stopped(_, signal) => Ok(StopReason::Signal(signal)),
            WaitStatus::Exited(_, code) => Ok(StopReason::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Ok(StopReason::Signal(signal)),
            _ => Ok(StopReason::Other),
        }
    }

    /// プロセスを停止させる
    pub fn interrupt(&self) -> Result<()> {
        nix::sys::ptrace::interrupt(self.pid)?;
        Ok(())
    }

    /// プロセスからデタッチする
    pub fn detach(self) -> Result<()> {
        nix::sys::ptrace::detach(self.pid, None)?;
        Ok(())
    }

    /// プロセスを強制終了する
    ///
    /// 評価の中断要求に応答しない場合の最終手段としてのみ呼ばれます。
    pub fn terminate(&self) -> Result<()> {
        nix::sys::signal::kill(self.pid, Signal::SIGKILL)?;
        Ok(())
    }
}
