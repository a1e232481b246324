//! テスト用の合成ターゲット
//!
//! 実プロセスなしで検査の全経路を動かすためのインメモリターゲットです。
//! 上位クレートのテストがプロキシ層・ステップ制御・評価タイムアウトを
//! 検証するときに使うため、公開モジュールにしています。

use crate::{Result, TargetAccess, TargetError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

/// 合成インメモリターゲット
///
/// `map`で領域を確保し、`TargetAccess`経由で読み書きします。
/// マップ外へのアクセスは実プロセスと同様にエラーになります。
pub struct FakeTarget {
    regions: Mutex<Vec<Region>>,
    alive: AtomicBool,
}

impl FakeTarget {
    /// 空のターゲットを作成する
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        }
    }

    /// ゼロ初期化された領域をマップする
    pub fn map(&self, base: u64, size: usize) {
        let mut regions = self.regions.lock().unwrap_or_else(|p| p.into_inner());
        regions.push(Region {
            base,
            bytes: vec![0u8; size],
        });
    }

    /// プロセス終了をシミュレートする
    ///
    /// 以後のすべてのアクセスは`ProcessGone`を返します。
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn locate(
        regions: &mut [Region],
        addr: u64,
        len: usize,
    ) -> Option<(usize, usize)> {
        for (idx, region) in regions.iter().enumerate() {
            let end = region.base + region.bytes.len() as u64;
            if addr >= region.base && addr + len as u64 <= end {
                return Some((idx, (addr - region.base) as usize));
            }
        }
        None
    }
}

impl Default for FakeTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetAccess for FakeTarget {
    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        if !self.is_alive() {
            return Err(TargetError::ProcessGone);
        }
        let mut regions = self.regions.lock().unwrap_or_else(|p| p.into_inner());
        match Self::locate(&mut regions, addr, len) {
            Some((idx, off)) => Ok(regions[idx].bytes[off..off + len].to_vec()),
            None => Err(TargetError::ReadFailed {
                addr,
                len,
                source: std::io::Error::from_raw_os_error(14), // EFAULT
            }),
        }
    }

    fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(TargetError::ProcessGone);
        }
        let mut regions = self.regions.lock().unwrap_or_else(|p| p.into_inner());
        match Self::locate(&mut regions, addr, data.len()) {
            Some((idx, off)) => {
                regions[idx].bytes[off..off + data.len()].copy_from_slice(data);
                Ok(())
            }
            None => Err(TargetError::WriteFailed {
                addr,
                len: data.len(),
                source: std::io::Error::from_raw_os_error(14),
            }),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
