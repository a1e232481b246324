//! ソフトウェアブレークポイント

use crate::memory::{TargetAccess, TargetAccessExt};
use crate::Result;

/// INT3命令のオペコード
const INT3_OPCODE: u8 = 0xCC;

/// ソフトウェアブレークポイント（INT3命令）
///
/// ステップゲートや復帰アドレスに打つ一時ブレークポイントもこの型を
/// 使います。`disable`は必ず元のバイトを復元します。
#[derive(Debug)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 置き換え前のバイトを取得する
    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    /// ブレークポイントを設定する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    pub fn enable(&mut self, target: &dyn TargetAccess) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        self.original_byte = target.read_typed::<u8>(self.address)?;
        target.write_typed::<u8>(self.address, &INT3_OPCODE)?;

        self.enabled = true;
        Ok(())
    }

    /// ブレークポイントを解除する
    ///
    /// INT3命令を元のバイトで置き換えます。
    pub fn disable(&mut self, target: &dyn TargetAccess) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        target.write_typed::<u8>(self.address, &self.original_byte)?;

        self.enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeTarget;

    #[test]
    fn enable_saves_and_disable_restores_original_byte() {
        let target = FakeTarget::new();
        target.map(0x1000, 16);
        target.write_bytes(0x1000, &[0x55, 0x48, 0x89, 0xe5]).unwrap();

        let mut bp = SoftwareBreakpoint::new(0x1001);
        bp.enable(&target).unwrap();
        assert_eq!(target.read_bytes(0x1001, 1).unwrap(), vec![0xCC]);
        assert_eq!(bp.original_byte(), 0x48);

        bp.disable(&target).unwrap();
        assert_eq!(target.read_bytes(0x1001, 1).unwrap(), vec![0x48]);
    }

    #[test]
    fn double_enable_keeps_first_original_byte() {
        let target = FakeTarget::new();
        target.map(0x2000, 8);
        target.write_bytes(0x2000, &[0x90]).unwrap();

        let mut bp = SoftwareBreakpoint::new(0x2000);
        bp.enable(&target).unwrap();
        bp.enable(&target).unwrap();
        assert_eq!(bp.original_byte(), 0x90);
    }
}
