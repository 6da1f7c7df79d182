//! コンソールのコマンド

use serde_json::Value;
use tomare_target::{MemoryOperation, Protection, ThreadId};

/// コンソールのコマンド
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// ネイティブフックを登録（条件は省略可）
    Hook { address: String, condition: Option<String> },
    /// フックを削除
    Unhook(String),
    /// 条件を置き換える（空なら消す）
    Cond { key: String, source: String },
    /// ロジックを置き換える（空なら消す）
    Logic { key: String, source: String },
    /// メモリ監視を追加
    Watch { address: String, flags: Option<u8> },
    /// メモリ監視を外す
    Unwatch(String),
    /// シミュレーションのメモリをマップ
    Map { address: String, size: String, protection: Protection },
    /// スレッドにアドレスを実行させる
    Call { tid: ThreadId, address: String },
    /// スレッドにメモリアクセスさせる
    Access { tid: ThreadId, address: String, operation: MemoryOperation },
    /// 名前付きAPIを呼ぶ
    Api { tid: ThreadId, name: String, args: Vec<Value> },
    /// 停止中のスレッドを再開
    Release(Option<ThreadId>),
    /// ステップ実行（省略時は命令単位）
    Step { tid: Option<ThreadId>, mode: Option<String> },
    /// ステップ実行を終了
    Stop(Option<ThreadId>),
    /// フック一覧
    Hooks,
    /// 停止中のスレッド一覧
    Threads,
    Detach,
    Help,
    Quit,
}

fn tid(s: &str) -> Option<ThreadId> {
    s.parse().ok()
}

fn operation(s: &str) -> Option<MemoryOperation> {
    match s {
        "r" | "read" => Some(MemoryOperation::Read),
        "w" | "write" => Some(MemoryOperation::Write),
        "x" | "execute" => Some(MemoryOperation::Execute),
        _ => None,
    }
}

/// `api` の引数（JSON配列か単一の値）
fn api_args(rest: &str) -> Option<Vec<Value>> {
    if rest.trim().is_empty() {
        return Some(Vec::new());
    }
    match serde_json::from_str(rest).ok()? {
        Value::Array(args) => Some(args),
        value => Some(vec![value]),
    }
}

/// 先頭から `n` 個の単語と残りの文字列に分ける
fn split_words(input: &str, n: usize) -> (Vec<&str>, &str) {
    let mut words = Vec::new();
    let mut rest = input.trim();
    while words.len() < n {
        if rest.is_empty() {
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                words.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                words.push(rest);
                rest = "";
            }
        }
    }
    (words, rest)
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let (head, rest) = split_words(input, 1);
        let name = *head.first()?;

        match name {
            "hook" | "b" => {
                let (words, condition) = split_words(rest, 1);
                Some(Command::Hook {
                    address: words.first()?.to_string(),
                    condition: (!condition.is_empty()).then(|| condition.to_string()),
                })
            }
            "unhook" | "d" => {
                let (words, _) = split_words(rest, 1);
                Some(Command::Unhook(words.first()?.to_string()))
            }
            "cond" | "logic" => {
                let (words, source) = split_words(rest, 1);
                let key = words.first()?.to_string();
                let source = source.to_string();
                Some(if name == "cond" {
                    Command::Cond { key, source }
                } else {
                    Command::Logic { key, source }
                })
            }
            "watch" | "w" => {
                let (words, _) = split_words(rest, 2);
                let flags = match words.get(1) {
                    Some(f) => Some(f.parse().ok()?),
                    None => None,
                };
                Some(Command::Watch {
                    address: words.first()?.to_string(),
                    flags,
                })
            }
            "unwatch" => {
                let (words, _) = split_words(rest, 1);
                Some(Command::Unwatch(words.first()?.to_string()))
            }
            "map" => {
                let (words, _) = split_words(rest, 3);
                let protection = match words.get(2) {
                    Some(p) => p.parse().ok()?,
                    None => Protection::READ_WRITE,
                };
                Some(Command::Map {
                    address: words.first()?.to_string(),
                    size: words.get(1)?.to_string(),
                    protection,
                })
            }
            "call" => {
                let (words, _) = split_words(rest, 2);
                Some(Command::Call {
                    tid: tid(words.first()?)?,
                    address: words.get(1)?.to_string(),
                })
            }
            "access" => {
                let (words, _) = split_words(rest, 3);
                Some(Command::Access {
                    tid: tid(words.first()?)?,
                    address: words.get(1)?.to_string(),
                    operation: operation(words.get(2)?)?,
                })
            }
            "api" => {
                let (words, args) = split_words(rest, 2);
                Some(Command::Api {
                    tid: tid(words.first()?)?,
                    name: words.get(1)?.to_string(),
                    args: api_args(args)?,
                })
            }
            "release" | "r" | "c" => {
                let (words, _) = split_words(rest, 1);
                Some(Command::Release(words.first().and_then(|w| tid(w))))
            }
            "step" | "s" => {
                // `step [tid] [block|call]`
                let (words, _) = split_words(rest, 2);
                let (tid, mode) = match words.as_slice() {
                    [] => (None, None),
                    [one] => match tid(one) {
                        Some(t) => (Some(t), None),
                        None => (None, Some(one.to_string())),
                    },
                    [t, mode, ..] => (Some(tid(t)?), Some(mode.to_string())),
                };
                Some(Command::Step { tid, mode })
            }
            "stop" => {
                let (words, _) = split_words(rest, 1);
                Some(Command::Stop(words.first().and_then(|w| tid(w))))
            }
            "hooks" => Some(Command::Hooks),
            "threads" => Some(Command::Threads),
            "detach" => Some(Command::Detach),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}
