//! スカラープロキシ
//!
//! （ターゲット参照, アドレス）だけを持つ型付きハンドルです。
//! 読み書きは毎回ターゲットメモリに当たり、値をキャッシュしません。

use crate::{ProxyError, Result};
use std::marker::PhantomData;
use std::sync::Arc;
use tsubaki_target::{MemoryReadable, TargetAccess, TargetAccessExt};

/// ターゲット内スカラー値へのプロキシ
pub struct ScalarProxy<T: MemoryReadable> {
    target: Arc<dyn TargetAccess>,
    address: u64,
    _marker: PhantomData<T>,
}

impl<T: MemoryReadable> ScalarProxy<T> {
    /// プロキシを作成する
    pub fn new(target: Arc<dyn TargetAccess>, address: u64) -> Self {
        Self {
            target,
            address,
            _marker: PhantomData,
        }
    }

    /// ターゲット内アドレス
    pub fn address(&self) -> u64 {
        self.address
    }

    /// 値を読み取る
    pub fn read(&self) -> Result<T> {
        if self.address == 0 {
            return Err(ProxyError::NullPointer { what: "scalar proxy" });
        }
        Ok(self.target.read_typed::<T>(self.address)?)
    }

    /// 値を書き込む
    pub fn write(&self, value: &T) -> Result<()> {
        if self.address == 0 {
            return Err(ProxyError::NullPointer { what: "scalar proxy" });
        }
        Ok(self.target.write_typed::<T>(self.address, value)?)
    }
}

impl<T: MemoryReadable> Clone for ScalarProxy<T> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            address: self.address,
            _marker: PhantomData,
        }
    }
}
