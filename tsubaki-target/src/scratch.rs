//! スクラッチ領域アロケータ
//!
//! ヘルパーモジュールがターゲット内にエクスポートする作業用バッファを
//! デバッガ側で切り出して使うための単純なフリーリストアロケータです。
//! ブレークポイントデータ、遅延解放リストのノード、評価時に生成する
//! オブジェクトはすべてここから確保します。

use crate::{Result, TargetError};

/// 確保単位のアラインメント
const ALIGN: u64 = 16;

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    addr: u64,
    size: u64,
}

/// ターゲット内スクラッチ領域のアロケータ
///
/// 管理情報はデバッガ側にのみ存在し、ターゲットのメモリには
/// 確保済みデータ以外何も書き込みません。
pub struct ScratchArena {
    base: u64,
    size: u64,
    free: Vec<FreeBlock>,
    live: Vec<FreeBlock>,
}

impl ScratchArena {
    /// スクラッチ領域 [base, base+size) を管理するアロケータを作成する
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            free: vec![FreeBlock { addr: base, size }],
            live: Vec::new(),
        }
    }

    /// 領域の先頭アドレス
    pub fn base(&self) -> u64 {
        self.base
    }

    /// 領域の全体サイズ
    pub fn size(&self) -> u64 {
        self.size
    }

    /// 現在確保中のバイト数
    pub fn live_bytes(&self) -> u64 {
        self.live.iter().map(|b| b.size).sum()
    }

    /// `size`バイトを確保してターゲット内アドレスを返す
    pub fn alloc(&mut self, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(TargetError::ScratchExhausted { requested: 0 });
        }
        let need = (size as u64 + ALIGN - 1) & !(ALIGN - 1);

        // first-fit
        let idx = self
            .free
            .iter()
            .position(|b| b.size >= need)
            .ok_or(TargetError::ScratchExhausted { requested: size })?;

        let block = self.free[idx];
        let addr = block.addr;
        if block.size == need {
            self.free.remove(idx);
        } else {
            self.free[idx] = FreeBlock {
                addr: block.addr + need,
                size: block.size - need,
            };
        }
        self.live.push(FreeBlock { addr, size: need });
        Ok(addr)
    }

    /// 確保済みブロックを解放する
    ///
    /// 隣接するフリーブロックとは結合します。
    pub fn free(&mut self, addr: u64) -> Result<()> {
        let idx = self
            .live
            .iter()
            .position(|b| b.addr == addr)
            .ok_or(TargetError::BadScratchFree { addr })?;
        let block = self.live.remove(idx);

        self.free.push(block);
        self.free.sort_by_key(|b| b.addr);

        // 隣接ブロックの結合
        let mut merged: Vec<FreeBlock> = Vec::with_capacity(self.free.len());
        for b in self.free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.addr + last.size == b.addr => last.size += b.size,
                _ => merged.push(b),
            }
        }
        self.free = merged;
        Ok(())
    }
}
