//! 代入式リテラルの解析
//!
//! 値の書き換えで受け付けるのはリテラルだけです。任意の式の評価は
//! 別経路（ターゲット内評価）であり、ここでは行いません。

use crate::{ProxyError, Result};

/// 解析済みリテラル
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Complex { real: f64, imag: f64 },
}

/// リテラル式を解析する
///
/// 受け付ける形式: `None` / `True` / `False` / 整数（10進・0x・0o・0b）/
/// 浮動小数 / 複素数（`2j`、`1+2j`）/ 文字列 / バイト列。
/// それ以外は`UnsupportedLiteral`です。
pub fn parse_literal(input: &str) -> Result<Literal> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ProxyError::UnsupportedLiteral);
    }

    match s {
        "None" => return Ok(Literal::None),
        "True" => return Ok(Literal::Bool(true)),
        "False" => return Ok(Literal::Bool(false)),
        _ => {}
    }

    if let Some(rest) = s.strip_prefix('b').or_else(|| s.strip_prefix('B')) {
        if rest.starts_with('\'') || rest.starts_with('"') {
            return Ok(Literal::Bytes(parse_quoted_bytes(rest)?));
        }
    }
    if s.starts_with('\'') || s.starts_with('"') {
        return Ok(Literal::Str(parse_quoted(s)?));
    }

    if let Some(lit) = parse_complex(s)? {
        return Ok(lit);
    }
    if let Some(value) = parse_int(s) {
        return Ok(Literal::Int(value));
    }
    if let Ok(value) = s.parse::<f64>() {
        return Ok(Literal::Float(value));
    }

    Err(ProxyError::UnsupportedLiteral)
}

/// エスケープシーケンスを1つ解釈してバイト値を返す
///
/// 文字列モードでは`char::from`で文字に戻します（`\xNN`は
/// U+0000..=U+00FFの範囲に収まります）。
fn parse_escape(chars: &mut std::str::Chars<'_>) -> Result<u8> {
    match chars.next() {
        Some('n') => Ok(b'\n'),
        Some('r') => Ok(b'\r'),
        Some('t') => Ok(b'\t'),
        Some('0') => Ok(0),
        Some('\\') => Ok(b'\\'),
        Some('\'') => Ok(b'\''),
        Some('"') => Ok(b'"'),
        Some('x') => {
            let hi = chars.next().ok_or(ProxyError::UnsupportedLiteral)?;
            let lo = chars.next().ok_or(ProxyError::UnsupportedLiteral)?;
            u8::from_str_radix(&format!("{}{}", hi, lo), 16)
                .map_err(|_| ProxyError::UnsupportedLiteral)
        }
        _ => Err(ProxyError::UnsupportedLiteral),
    }
}

/// 引用符つき文字列を解釈する
fn parse_quoted(s: &str) -> Result<String> {
    let mut chars = s.chars();
    let quote = chars.next().ok_or(ProxyError::UnsupportedLiteral)?;
    if quote != '\'' && quote != '"' {
        return Err(ProxyError::UnsupportedLiteral);
    }

    let mut out = String::new();
    let mut closed = false;
    while let Some(ch) = chars.next() {
        if closed {
            // 終端引用符の後に文字が残っている
            return Err(ProxyError::UnsupportedLiteral);
        }
        match ch {
            c if c == quote => closed = true,
            '\\' => out.push(char::from(parse_escape(&mut chars)?)),
            c => out.push(c),
        }
    }
    if !closed {
        return Err(ProxyError::UnsupportedLiteral);
    }
    Ok(out)
}

/// 引用符つきバイト列を解釈する
///
/// `String`を経由するとASCII外のバイトがUTF-8に化けるため、
/// 生バイトのまま組み立てます。ASCII外の文字はエスケープでしか
/// 表せません（CPythonのバイト列リテラルと同じ制約）。
fn parse_quoted_bytes(s: &str) -> Result<Vec<u8>> {
    let mut chars = s.chars();
    let quote = chars.next().ok_or(ProxyError::UnsupportedLiteral)?;
    if quote != '\'' && quote != '"' {
        return Err(ProxyError::UnsupportedLiteral);
    }

    let mut out = Vec::new();
    let mut closed = false;
    while let Some(ch) = chars.next() {
        if closed {
            return Err(ProxyError::UnsupportedLiteral);
        }
        match ch {
            c if c == quote => closed = true,
            '\\' => out.push(parse_escape(&mut chars)?),
            c if c.is_ascii() => out.push(c as u8),
            _ => return Err(ProxyError::UnsupportedLiteral),
        }
    }
    if !closed {
        return Err(ProxyError::UnsupportedLiteral);
    }
    Ok(out)
}

/// 整数リテラルを解釈する（基数プレフィックス対応）
fn parse_int(s: &str) -> Option<i128> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = body.strip_prefix("0o").or_else(|| body.strip_prefix("0O")) {
        i128::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        i128::from_str_radix(bin, 2).ok()?
    } else {
        body.parse::<i128>().ok()?
    };
    Some(if negative { -value } else { value })
}

/// 複素数リテラルを解釈する
///
/// `2j`、`-1.5j`、`1+2j`、`1.5-2.5j` の形式を受け付けます。
fn parse_complex(s: &str) -> Result<Option<Literal>> {
    if !s.ends_with('j') && !s.ends_with('J') {
        return Ok(None);
    }
    let body = &s[..s.len() - 1];
    if !body.is_ascii() {
        return Err(ProxyError::UnsupportedLiteral);
    }

    // 純虚数
    if let Ok(imag) = body.parse::<f64>() {
        return Ok(Some(Literal::Complex { real: 0.0, imag }));
    }
    if body.is_empty() || body == "+" || body == "-" {
        let imag = if body == "-" { -1.0 } else { 1.0 };
        return Ok(Some(Literal::Complex { real: 0.0, imag }));
    }

    // a+bj / a-bj: 先頭の符号を飛ばして実部と虚部の境界を探す
    for (i, ch) in body.char_indices().skip(1) {
        if (ch == '+' || ch == '-') && !matches!(&body[i - 1..i], "e" | "E") {
            let real: f64 = body[..i]
                .parse()
                .map_err(|_| ProxyError::UnsupportedLiteral)?;
            let imag_part = &body[i..];
            let imag: f64 = if imag_part == "+" {
                1.0
            } else if imag_part == "-" {
                -1.0
            } else {
                imag_part.parse().map_err(|_| ProxyError::UnsupportedLiteral)?
            };
            return Ok(Some(Literal::Complex { real, imag }));
        }
    }
    Err(ProxyError::UnsupportedLiteral)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_and_numbers() {
        assert_eq!(parse_literal("None").unwrap(), Literal::None);
        assert_eq!(parse_literal(" True ").unwrap(), Literal::Bool(true));
        assert_eq!(parse_literal("42").unwrap(), Literal::Int(42));
        assert_eq!(parse_literal("-0x1f").unwrap(), Literal::Int(-31));
        assert_eq!(parse_literal("0b101").unwrap(), Literal::Int(5));
        assert_eq!(parse_literal("3.5").unwrap(), Literal::Float(3.5));
        assert_eq!(parse_literal("-1e3").unwrap(), Literal::Float(-1000.0));
    }

    #[test]
    fn strings_and_bytes() {
        assert_eq!(
            parse_literal("'hello'").unwrap(),
            Literal::Str("hello".to_string())
        );
        assert_eq!(
            parse_literal("\"a\\n'b'\"").unwrap(),
            Literal::Str("a\n'b'".to_string())
        );
        assert_eq!(
            parse_literal("b'\\x01\\x02'").unwrap(),
            Literal::Bytes(vec![1, 2])
        );
    }

    #[test]
    fn bytes_keep_high_bit_escapes_raw() {
        assert_eq!(
            parse_literal("b'\\xff'").unwrap(),
            Literal::Bytes(vec![0xff])
        );
        assert_eq!(
            parse_literal("b'a\\x80z'").unwrap(),
            Literal::Bytes(vec![b'a', 0x80, b'z'])
        );
        // 文字列リテラルでは\xffはU+00FF
        assert_eq!(
            parse_literal("'\\xff'").unwrap(),
            Literal::Str("\u{ff}".to_string())
        );
        // バイト列リテラル中のASCII外文字はエスケープ必須
        assert!(matches!(
            parse_literal("b'ÿ'"),
            Err(ProxyError::UnsupportedLiteral)
        ));
    }

    #[test]
    fn complex_forms() {
        assert_eq!(
            parse_literal("2j").unwrap(),
            Literal::Complex { real: 0.0, imag: 2.0 }
        );
        assert_eq!(
            parse_literal("1+2j").unwrap(),
            Literal::Complex { real: 1.0, imag: 2.0 }
        );
        assert_eq!(
            parse_literal("-1.5-2.5j").unwrap(),
            Literal::Complex { real: -1.5, imag: -2.5 }
        );
    }

    #[test]
    fn rejects_everything_else() {
        for bad in ["foo", "1 + 2", "[1]", "'unterminated", "f(x)", ""] {
            assert!(
                matches!(parse_literal(bad), Err(ProxyError::UnsupportedLiteral)),
                "{} should be rejected",
                bad
            );
        }
    }
}
