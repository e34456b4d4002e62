/// エラー分類
///
/// 4種のエラー種別（kind）を区別する: Parse / Execution / LowLevel / Decoder。
/// LowLevelは現在の関数に対して致命的であり、呼び出し側が abortFunction 相当の
/// 処理を行って次の関数へ進めることを前提とする。Decoderはエンコード済み文書の
/// 構文エラーで、現在の操作に対して致命的。
use thiserror::Error;

/// コア全体で共有されるエラー種別
#[derive(Debug, Error)]
pub enum CoreError {
    /// 不正なコマンド・入力ストリーム（回復可能、利用者に報告の上でエンジンは継続）
    #[error("Parse: {0}")]
    Parse(String),

    /// 現在の状態に適用できない操作（関数単位で回復可能）
    #[error("Execution: {0}")]
    Execution(String),

    /// エンジン内部の不変条件違反（現在の関数にとって致命的）
    #[error("Low-level ERROR: {0}")]
    LowLevel(String),

    /// エンコードされた文書が不正（現在の操作にとって致命的）
    #[error("Decoding ERROR: {0}")]
    Decoder(String),
}

impl CoreError {
    pub fn low_level(msg: impl Into<String>) -> Self {
        CoreError::LowLevel(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        CoreError::Execution(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        CoreError::Parse(msg.into())
    }

    pub fn decoder(msg: impl Into<String>) -> Self {
        CoreError::Decoder(msg.into())
    }

    /// このエラーが単一関数の異常終了で済むか（falseならアーキテクチャ/ロード全体が失敗）
    pub fn is_function_local(&self) -> bool {
        matches!(self, CoreError::Execution(_) | CoreError::LowLevel(_))
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
