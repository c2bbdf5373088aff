//! 皮膚画像分類モデルの学習・出力ツール
//!
//! 事前学習済み MobileNetV2 をクラスごとのディレクトリ構成の画像で微調整し、
//! テストデータで評価した後、チェックポイント・量子化モデル・クラスラベルを出力します。

#![recursion_limit = "256"]

pub mod ml;
pub mod ml_commands;
pub mod model;
