//! ターゲットメモリアクセス
//!
//! 実プロセス（/proc/pid/mem + ptraceフォールバック）と合成ターゲットの
//! 両方を同じ `TargetAccess` トレイト経由で扱います。上位レイヤは
//! このトレイトオブジェクトだけを見るため、テストでは実プロセスなしで
//! 全経路を検証できます。

use crate::{Result, TargetError};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};

/// メモリから読み書き可能なスカラー型
pub trait MemoryReadable: Sized {
    /// バイト配列から値を構築
    fn from_le_bytes(bytes: &[u8]) -> Result<Self>;

    /// リトルエンディアンバイト配列に変換
    fn to_le_bytes(&self) -> Vec<u8>;

    /// 型のサイズ（バイト数）
    fn size() -> usize;
}

macro_rules! impl_memory_readable {
    ($ty:ty, $bytes:expr) => {
        impl MemoryReadable for $ty {
            fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
                let array: [u8; $bytes] =
                    bytes.try_into().map_err(|_| TargetError::DecodeFailed {
                        type_name: stringify!($ty),
                        got: bytes.len(),
                        expected: $bytes,
                    })?;
                Ok(<$ty>::from_le_bytes(array))
            }

            fn to_le_bytes(&self) -> Vec<u8> {
                (*self).to_le_bytes().to_vec()
            }

            fn size() -> usize {
                $bytes
            }
        }
    };
}

impl_memory_readable!(u16, 2);
impl_memory_readable!(u32, 4);
impl_memory_readable!(u64, 8);
impl_memory_readable!(i16, 2);
impl_memory_readable!(i32, 4);
impl_memory_readable!(i64, 8);
impl_memory_readable!(f64, 8);

impl MemoryReadable for u8 {
    fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        bytes.first().copied().ok_or(TargetError::DecodeFailed {
            type_name: "u8",
            got: 0,
            expected: 1,
        })
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        vec![*self]
    }

    fn size() -> usize {
        1
    }
}

/// ターゲットプロセスのメモリへのアクセス
///
/// 実装は実プロセス（`ProcessMemory`）または合成ターゲット
/// （`FakeTarget`）です。アドレス0への読み書きは実装側で拒否されます。
pub trait TargetAccess: Send + Sync {
    /// 指定アドレスから`len`バイト読み取る
    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// 指定アドレスにバイト列を書き込む
    fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// プロセスが生存しているかどうか
    fn is_alive(&self) -> bool;

    /// ポインタサイズ（バイト数）
    fn pointer_size(&self) -> usize {
        8
    }
}

/// `TargetAccess` の型付きヘルパー
pub trait TargetAccessExt: TargetAccess {
    /// 型付き値を読み取る
    fn read_typed<T: MemoryReadable>(&self, addr: u64) -> Result<T> {
        let bytes = self.read_bytes(addr, T::size())?;
        T::from_le_bytes(&bytes)
    }

    /// 型付き値を書き込む
    fn write_typed<T: MemoryReadable>(&self, addr: u64, value: &T) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// ポインタ値を読み取る
    fn read_pointer(&self, addr: u64) -> Result<u64> {
        self.read_typed::<u64>(addr)
    }

    /// NUL終端文字列を読み取る（`limit`バイトまで）
    fn read_cstring(&self, addr: u64, limit: usize) -> Result<String> {
        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < limit {
            let chunk_len = (limit - out.len()).min(64);
            let chunk = self.read_bytes(cursor, chunk_len)?;
            if let Some(pos) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..pos]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk);
            cursor += chunk_len as u64;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl<T: TargetAccess + ?Sized> TargetAccessExt for T {}

/// 実プロセスのメモリアクセス
///
/// /proc/pid/memを使用してターゲットプロセスのメモリを読み書きします。
/// 読み取りがEIOで失敗した場合（ガードページ等）はPTRACE_PEEKDATAに
/// フォールバックします。
pub struct ProcessMemory {
    pid: Pid,
}

impl ProcessMemory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATA経由でメモリを読み取る（内部実装）
    fn read_via_ptrace(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut buffer = Vec::with_capacity(len);
        let mut cursor = addr as usize & !7;
        let skip = addr as usize - cursor;

        while buffer.len() < skip + len {
            let word = ptrace::read(self.pid, cursor as ptrace::AddressType)?;
            buffer.extend_from_slice(&(word as u64).to_le_bytes());
            cursor += 8;
        }

        Ok(buffer[skip..skip + len].to_vec())
    }
}

impl TargetAccess for ProcessMemory {
    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        if !self.is_alive() {
            return Err(TargetError::ProcessGone);
        }

        match self.read_via_proc_mem(addr, len) {
            Ok(data) => Ok(data),
            Err(e) if e.raw_os_error() == Some(5) => {
                // EIO: ptraceにフォールバック
                self.read_via_ptrace(addr, len)
            }
            Err(e) => Err(TargetError::ReadFailed {
                addr,
                len,
                source: e,
            }),
        }
    }

    fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(TargetError::ProcessGone);
        }

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).open(self.mem_path())?;
            file.seek(SeekFrom::Start(addr))?;
            file.write_all(data)
        };

        write().map_err(|e| TargetError::WriteFailed {
            addr,
            len: data.len(),
            source: e,
        })
    }

    fn is_alive(&self) -> bool {
        std::path::Path::new(&format!("/proc/{}", self.pid)).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_round_trips_through_le_bytes() {
        let value = 0xdead_beef_cafe_u64;
        let bytes = MemoryReadable::to_le_bytes(&value);
        assert_eq!(
            <u64 as MemoryReadable>::from_le_bytes(&bytes).unwrap(),
            value
        );
    }

    #[test]
    fn short_buffer_is_a_decode_error() {
        let err = <u32 as MemoryReadable>::from_le_bytes(&[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            TargetError::DecodeFailed { expected: 4, got: 2, .. }
        ));
    }
}
