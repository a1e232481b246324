//! ブレークポイント表とターゲットメモリへのミラーリング
//!
//! 論理ブレークポイントは（ファイル名, 行番号）→ ハンドル集合の対応表
//! としてデバッガ側に保持され、変更のたびにフラットなバイナリブロブへ
//! 直列化してターゲット内のヘルパーへミラーされます。ヘルパーの
//! トレースコールバックはデバッガへ問い合わせることなくこのブロブ
//! だけを見て停止判定を行います。
//!
//! ブロブは二重バッファです。書き込みは常に非アクティブスロットへ行い、
//! 最後にアクティブスロット番号の1バイトを反転します。この順序により
//! トレースコールバックが書きかけの表を観測することはありません。

use std::collections::BTreeMap;

use tsubaki_bus::SourceLocation;
use tsubaki_target::TargetAccess;

use crate::helper::{HelperExports, BLOB_SLOT_CAPACITY};
use crate::Result;

/// ブレークポイントハンドル
pub type BreakpointId = usize;

/// ミラーブロブのワイヤ形式
///
/// ```text
/// max_line_number: i32
/// line_number_table: i32[max_line_number + 1]   グループ表への添字、0 = なし
/// group_table: i32[...]                         0終端グループの列、先頭は番兵0
/// string_pool: { len: u32, utf16: u16[len] }*   グループの値はプールへのバイトオフセット
/// ```
///
/// プールの先頭4バイトは予約語です。オフセット0はグループ表の
/// 終端0と区別できないため、実ファイル名には使いません。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointBlob {
    max_line: i32,
    line_table: Vec<i32>,
    group_table: Vec<i32>,
    string_pool: Vec<u8>,
}

/// 論理ブレークポイント表
///
/// 1つのソース位置が複数の論理ブレークポイントを持つことがあります
/// （同じ行に対して複数のクライアントが設定した場合）。
pub struct BreakpointTable {
    by_location: BTreeMap<(String, i32), Vec<BreakpointId>>,
    next_id: BreakpointId,
}

impl BreakpointTable {
    /// 空の表を作成する
    pub fn new() -> Self {
        Self {
            by_location: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// ソース位置にブレークポイントを追加し、ハンドルを返す
    pub fn add(&mut self, location: &SourceLocation) -> BreakpointId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_location
            .entry((location.file_name.clone(), location.line))
            .or_default()
            .push(id);
        tracing::debug!(file = %location.file_name, line = location.line, id, "breakpoint added");
        id
    }

    /// ハンドル指定でブレークポイントを削除する
    ///
    /// 記録がないハンドルは何もしません（他セッションからの通知が
    /// 遅延して届くことがあるため、エラーにはしません）。
    pub fn remove(&mut self, id: BreakpointId) {
        let mut empty_keys = Vec::new();
        for (key, ids) in self.by_location.iter_mut() {
            ids.retain(|&x| x != id);
            if ids.is_empty() {
                empty_keys.push(key.clone());
            }
        }
        for key in empty_keys {
            self.by_location.remove(&key);
        }
    }

    /// ソース位置に対応するハンドル列を引く
    pub fn handles_at(&self, file: &str, line: i32) -> &[BreakpointId] {
        self.by_location
            .get(&(file.to_string(), line))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// 全ブレークポイントを(ハンドル, ファイル, 行)で列挙する
    pub fn iter(&self) -> impl Iterator<Item = (BreakpointId, &str, i32)> {
        self.by_location
            .iter()
            .flat_map(|((file, line), ids)| ids.iter().map(move |&id| (id, file.as_str(), *line)))
    }

    /// 登録済みハンドルの総数
    pub fn len(&self) -> usize {
        self.by_location.values().map(|v| v.len()).sum()
    }

    /// 表が空かどうか
    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }

    /// 現在の表からミラーブロブを構築する
    pub fn build_blob(&self) -> BreakpointBlob {
        // オフセット0はグループ表の終端と衝突するため予約
        let mut pool = vec![0u8; 4];
        let mut pool_offsets: BTreeMap<&str, i32> = BTreeMap::new();
        for (file, _) in self.by_location.keys() {
            if pool_offsets.contains_key(file.as_str()) {
                continue;
            }
            let offset = pool.len() as i32;
            let units: Vec<u16> = file.encode_utf16().collect();
            pool.extend_from_slice(&(units.len() as u32).to_le_bytes());
            for unit in &units {
                pool.extend_from_slice(&unit.to_le_bytes());
            }
            pool_offsets.insert(file.as_str(), offset);
        }

        let max_line = self
            .by_location
            .keys()
            .map(|(_, line)| *line)
            .max()
            .unwrap_or(0)
            .max(0);

        // 行番号 → その行にかかるファイルのプールオフセット集合
        let mut per_line: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
        for (file, line) in self.by_location.keys() {
            if *line < 0 {
                continue;
            }
            per_line
                .entry(*line)
                .or_default()
                .push(pool_offsets[file.as_str()]);
        }

        // 添字0は「なし」の予約値なので、グループ表は番兵で始める
        let mut group_table = vec![0i32];
        let mut line_table = vec![0i32; max_line as usize + 1];
        for (line, mut offsets) in per_line {
            offsets.sort_unstable();
            offsets.dedup();
            line_table[line as usize] = group_table.len() as i32;
            group_table.extend_from_slice(&offsets);
            group_table.push(0);
        }

        BreakpointBlob {
            max_line,
            line_table,
            group_table,
            string_pool: pool,
        }
    }

    /// ブロブを再構築して非アクティブスロットへ書き込み、フラグを反転する
    ///
    /// データ書き込みとフラグ反転の順序が契約です。フラグの1バイト
    /// 書き込みが最後になるため、トレースコールバックは常に完結した
    /// 表を読みます。
    pub fn sync_to_target(
        &self,
        target: &dyn TargetAccess,
        helper: &HelperExports,
    ) -> Result<()> {
        let blob = self.build_blob();
        let bytes = blob.encode();
        if bytes.len() > BLOB_SLOT_CAPACITY {
            anyhow::bail!(
                "breakpoint blob too large: {} bytes (capacity {})",
                bytes.len(),
                BLOB_SLOT_CAPACITY
            );
        }
        let active = helper.read_active_slot(target)?;
        let inactive = 1 - (active & 1);
        target.write_bytes(helper.blob_slots[inactive as usize], &bytes)?;
        target.write_bytes(helper.active_slot_flag, &[inactive])?;
        tracing::debug!(slot = inactive, bytes = bytes.len(), "breakpoint blob mirrored");
        Ok(())
    }
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointBlob {
    /// ワイヤ形式へ直列化する
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.max_line.to_le_bytes());
        for v in &self.line_table {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.group_table {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.string_pool);
        out
    }

    /// ワイヤ形式から復元する
    ///
    /// ターゲット側トレースコールバックの判定ロジックをテストで
    /// 再現するために使います。グループ表の終端は「行表から参照される
    /// 最大添字より後の最初の孤立した0」ではなく、直列化時の長さを
    /// 前置しない代わりに行表の全参照を辿って判別します。
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let read_i32 = |pos: usize| -> Result<i32> {
            let chunk = bytes
                .get(pos..pos + 4)
                .ok_or_else(|| anyhow::anyhow!("breakpoint blob truncated at {}", pos))?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(chunk);
            Ok(i32::from_le_bytes(buf))
        };
        let max_line = read_i32(0)?;
        if max_line < 0 {
            anyhow::bail!("breakpoint blob has negative max line: {}", max_line);
        }
        let mut pos = 4;
        let mut line_table = Vec::with_capacity(max_line as usize + 1);
        for _ in 0..=max_line {
            line_table.push(read_i32(pos)?);
            pos += 4;
        }

        // グループ表の長さ: 番兵 + 参照されている各グループの0終端まで
        let group_base = pos;
        let mut group_end = 1usize;
        for &idx in &line_table {
            if idx <= 0 {
                continue;
            }
            let mut i = idx as usize;
            loop {
                let v = read_i32(group_base + i * 4)?;
                i += 1;
                if v == 0 {
                    break;
                }
            }
            group_end = group_end.max(i);
        }
        let mut group_table = Vec::with_capacity(group_end);
        for i in 0..group_end {
            group_table.push(read_i32(group_base + i * 4)?);
        }
        pos = group_base + group_end * 4;

        Ok(Self {
            max_line,
            line_table,
            group_table,
            string_pool: bytes[pos..].to_vec(),
        })
    }

    /// トレースコールバックと同じ手順で（ファイル, 行）の一致を判定する
    pub fn matches(&self, file: &str, line: i32) -> bool {
        if line < 0 || line > self.max_line {
            return false;
        }
        let group = self.line_table[line as usize];
        if group <= 0 {
            return false;
        }
        let mut i = group as usize;
        loop {
            let offset = match self.group_table.get(i) {
                Some(&v) if v != 0 => v,
                _ => return false,
            };
            if let Some(name) = self.pool_string(offset as usize) {
                if name == file {
                    return true;
                }
            }
            i += 1;
        }
    }

    fn pool_string(&self, offset: usize) -> Option<String> {
        let len_bytes: [u8; 4] = self.string_pool.get(offset..offset + 4)?.try_into().ok()?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut units = Vec::with_capacity(len);
        for i in 0..len {
            let at = offset + 4 + i * 2;
            let chunk: [u8; 2] = self.string_pool.get(at..at + 2)?.try_into().ok()?;
            units.push(u16::from_le_bytes(chunk));
        }
        String::from_utf16(&units).ok()
    }
}
