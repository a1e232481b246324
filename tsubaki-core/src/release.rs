//! 遅延参照カウント解放
//!
//! デバッガが所有するオブジェクト（`set`コマンドで置き換えられた旧値や
//! 評価用に生成した一時オブジェクト）の参照カウント減算は、その場では
//! 行えません。デストラクタがターゲットの内部ロックを握ったまま走ると
//! デッドロックするためです。代わりにターゲット内の連結リストへ積み、
//! 次にトレース関数が安全な地点で走ったときにヘルパー側で消化させます。

use tsubaki_target::{ScratchArena, TargetAccess, TargetAccessExt};

use crate::helper::HelperExports;
use crate::Result;

/// リストノードの形: `{ object: u64, next: u64 }`
const NODE_SIZE: usize = 16;

/// 遅延解放キュー
pub struct DecrefQueue {
    pending: Vec<u64>,
}

impl DecrefQueue {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// オブジェクトを解放予定に積む（デバッガ側のみ、ターゲット未反映）
    pub fn defer(&mut self, object_addr: u64) {
        if object_addr != 0 {
            self.pending.push(object_addr);
        }
    }

    /// 未反映の件数
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 積まれたオブジェクトをターゲット内のリストへ先頭挿入で反映する
    ///
    /// ヘルパーはリスト先頭ポインタを消化時にアトミックに付け替える
    /// ため、ここでは新ノードの書き込みを終えてから先頭ポインタを
    /// 更新します。反映した件数を返します。
    pub fn flush(
        &mut self,
        target: &dyn TargetAccess,
        arena: &mut ScratchArena,
        helper: &HelperExports,
    ) -> Result<usize> {
        let mut head = target.read_typed::<u64>(helper.objects_to_release)?;
        let count = self.pending.len();
        for object in self.pending.drain(..) {
            let node = arena.alloc(NODE_SIZE)?;
            let mut bytes = [0u8; NODE_SIZE];
            bytes[..8].copy_from_slice(&object.to_le_bytes());
            bytes[8..].copy_from_slice(&head.to_le_bytes());
            target.write_bytes(node, &bytes)?;
            head = node;
        }
        if count > 0 {
            target.write_bytes(helper.objects_to_release, &head.to_le_bytes())?;
            tracing::debug!(count, "queued deferred releases in target");
        }
        Ok(count)
    }
}

impl Default for DecrefQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tsubaki_target::FakeTarget;

    #[test]
    fn flush_builds_target_side_list() {
        let fake = Arc::new(FakeTarget::new());
        fake.map(0x10000, 0x80000);
        let helper = HelperExports::at_fixed(0x10000);
        let mut arena = ScratchArena::new(helper.scratch_base, helper.scratch_size);
        let target = fake.as_ref();

        let mut queue = DecrefQueue::new();
        queue.defer(0xa000);
        queue.defer(0xb000);
        queue.defer(0); // NULLは積まれない
        assert_eq!(queue.pending_len(), 2);

        assert_eq!(queue.flush(target, &mut arena, &helper).unwrap(), 2);
        assert_eq!(queue.pending_len(), 0);

        // 先頭は最後に積んだノードで、リンクを辿ると両方に届く
        let head = target.read_typed::<u64>(helper.objects_to_release).unwrap();
        let first_obj = target.read_typed::<u64>(head).unwrap();
        let next = target.read_typed::<u64>(head + 8).unwrap();
        assert_eq!(first_obj, 0xb000);
        let second_obj = target.read_typed::<u64>(next).unwrap();
        assert_eq!(second_obj, 0xa000);
        assert_eq!(target.read_typed::<u64>(next + 8).unwrap(), 0);
    }

    #[test]
    fn empty_flush_touches_nothing() {
        let fake = Arc::new(FakeTarget::new());
        fake.map(0x10000, 0x80000);
        let helper = HelperExports::at_fixed(0x10000);
        let mut arena = ScratchArena::new(helper.scratch_base, helper.scratch_size);

        let mut queue = DecrefQueue::new();
        assert_eq!(queue.flush(fake.as_ref(), &mut arena, &helper).unwrap(), 0);
        assert_eq!(arena.live_bytes(), 0);
    }
}
