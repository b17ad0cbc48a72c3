//! ペリフェラルと外部コラボレータの抽象化レイヤー
//!
//! 制御コアはレジスタを直接触らず、ここのトレイト経由でハードウェアを
//! 操作する。ファームウェア側が各ペリフェラルの実装を与え、ホストテストは
//! モックを与える。いずれのメソッドもISRから呼ばれる前提で、
//! ブロックするのはADCのEOC待ち（マイクロ秒オーダー）だけに留めること。

/// 補助ADCで多重化している温度チャネル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TempChannel {
    /// FET（基板）温度センサ
    Fet,
    /// モーター巻線温度センサ
    Motor,
}

/// 補助ADCの変換結果
#[derive(Debug, Clone, Copy, Default)]
pub struct AuxSample {
    /// バス電圧の生値（12bit）
    pub voltage_raw: u16,
    /// 選択中の温度チャネルの生値（12bit）
    pub temp_raw: u16,
}

/// 3相PWMタイマー
///
/// センターアライメントモードで動作し、カウント谷のアップデートイベントが
/// 制御ISRを駆動する。3本のゲートモニタ入力はPWM出力ピンに直結されていて、
/// 変換完了時点でハイサイドが開いていないことの検証に使う。
pub trait PwmDriver {
    /// タイマーを起動し、アップデートイベント割り込みを有効化する
    fn start(&mut self);

    /// 3相のデューティ比（0.0～1.0）をコンペアレジスタへ書き込む
    fn set_duty(&mut self, a: f32, b: f32, c: f32);

    /// ゲートモニタ入力のいずれかがハイならtrue
    fn any_output_high(&self) -> bool;

    /// PWM周期内の経過カウントと周期カウント（ループ余裕の計測用）
    fn cycle_position(&self) -> (u32, u32) {
        (0, 0)
    }
}

/// 電流×3 + バス電圧 + 温度のADC群
///
/// 3つの電流チャネルは同時スタートできること。補助側は電圧固定の1本と、
/// FET温度／モーター温度を時分割する1本の計2本。
pub trait ServoAdc {
    /// 電源投入後の一度きりの初期化（レギュレータ安定待ち、自己較正）
    fn initialize(&mut self, timer: &mut dyn MillisecondTimer);

    /// 各チャネルのサンプルサイクルを設定する
    fn set_sample_cycles(&mut self, current: u16, aux: u16);

    /// 全チャネルの変換を開始する（ノンブロッキング）
    fn start_conversions(&mut self);

    /// 3相電流の変換完了を待って生値を返す
    fn finish_currents(&mut self) -> [u16; 3];

    /// 補助チャネルの変換完了を待って生値を返す
    fn finish_aux(&mut self) -> AuxSample;

    /// 次回の変換で読む温度チャネルを切り替える
    fn select_temp_channel(&mut self, channel: TempChannel);
}

/// SPI接続の絶対磁気エンコーダ
///
/// トランザクションを非同期に開始し、他の処理と並行させてから回収する。
pub trait PositionSensor {
    /// 位置読み出しトランザクションを開始する
    fn start_sample(&mut self);

    /// トランザクション完了を待って16bit位置を返す
    fn finish_sample(&mut self) -> u16;
}

/// インバータのゲートドライバ
pub trait MotorDriver {
    /// ゲートドライバの有効化ライン（非RTコンテキストのみが操作する）
    fn enable(&mut self, enable: bool);

    /// PWM出力の通電許可（ISRのみが操作する）
    fn power(&mut self, power: bool);

    /// ドライバICのフォルト出力がアクティブならtrue
    fn fault(&mut self) -> bool;
}

/// ADC初期化時のbusy-wait用タイマー
pub trait MillisecondTimer {
    fn wait_us(&mut self, us: u32);
}

/// d軸電流のオシロスコープ観測用DAC
///
/// デバッグ専用。不要なら `()` を渡す。
pub trait DebugDac {
    fn write(&mut self, value: u16);
}

impl DebugDac for () {
    fn write(&mut self, _value: u16) {}
}
