//! ランタイムバージョンの検出
//!
//! インタプリタモジュールのファイル名からバージョンを特定します。
//! サポート範囲外のバージョンは明示的なエラーになります。

use crate::{ProxyError, Result};
use regex::Regex;

/// サポートするインタプリタのバージョン
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuntimeVersion {
    V310,
    V311,
    V312,
}

impl RuntimeVersion {
    /// マイナーバージョン番号からバージョンを返す
    pub fn from_minor(minor: u32) -> Result<Self> {
        match minor {
            10 => Ok(Self::V310),
            11 => Ok(Self::V311),
            12 => Ok(Self::V312),
            _ => Err(ProxyError::UnsupportedVersion { major: 3, minor }),
        }
    }

    /// モジュールパスからバージョンを検出する
    ///
    /// `python3.11`、`libpython3.12.so.1.0` のような名前にマッチします。
    pub fn detect(module_path: &str) -> Result<Self> {
        let re = Regex::new(r"python(\d+)\.(\d+)")
            .map_err(|e| ProxyError::VersionUndetected(e.to_string()))?;
        let caps = re.captures(module_path).ok_or_else(|| {
            ProxyError::VersionUndetected(format!(
                "no version marker in module name `{}`",
                module_path
            ))
        })?;

        let major: u32 = caps[1]
            .parse()
            .map_err(|_| ProxyError::VersionUndetected(module_path.to_string()))?;
        let minor: u32 = caps[2]
            .parse()
            .map_err(|_| ProxyError::VersionUndetected(module_path.to_string()))?;

        if major != 3 {
            return Err(ProxyError::UnsupportedVersion { major, minor });
        }
        Self::from_minor(minor)
    }

    /// 表示用のバージョン文字列
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V310 => "3.10",
            Self::V311 => "3.11",
            Self::V312 => "3.12",
        }
    }

    /// フレームチェインがヒープ上のフレームオブジェクトか、
    /// スレッド状態内のインタプリタフレームか
    pub fn uses_interpreter_frames(&self) -> bool {
        !matches!(self, Self::V310)
    }
}

impl std::fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_from_common_module_names() {
        assert_eq!(
            RuntimeVersion::detect("/usr/bin/python3.10").unwrap(),
            RuntimeVersion::V310
        );
        assert_eq!(
            RuntimeVersion::detect("/usr/lib/libpython3.12.so.1.0").unwrap(),
            RuntimeVersion::V312
        );
    }

    #[test]
    fn rejects_unsupported_versions() {
        assert!(matches!(
            RuntimeVersion::detect("/usr/bin/python3.9"),
            Err(ProxyError::UnsupportedVersion { major: 3, minor: 9 })
        ));
        assert!(matches!(
            RuntimeVersion::detect("/usr/bin/bash"),
            Err(ProxyError::VersionUndetected(_))
        ));
    }
}
