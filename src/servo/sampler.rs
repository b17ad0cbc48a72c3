//! サンプリングステージ
//!
//! 制御周期の先頭で走る。電流ADCはPWM谷（ローサイド全相ON）の間に変換を
//! 終える必要があるため、このステージの所要時間がそのまま最大デューティを
//! 削る。エンコーダのSPIトランザクションは電流変換の回収後に開始し、
//! 補助ADCの回収やワンショット指令の取り込みと並行させる。

use crate::config::MAX_POSITION_DELTA;
use crate::fmt::*;
use crate::hardware::{DebugDac, MotorDriver, PositionSensor, PwmDriver, ServoAdc, TempChannel};

use super::data::{CommandData, ErrorCode, Mode};
use super::BldcServo;

impl<PWM, ADC, ENC, DRV, DAC> BldcServo<PWM, ADC, ENC, DRV, DAC>
where
    PWM: PwmDriver,
    ADC: ServoAdc,
    ENC: PositionSensor,
    DRV: MotorDriver,
    DAC: DebugDac,
{
    /// ADCとエンコーダの読み取り、および読み取り妥当性の検証
    ///
    /// 返り値はinvert適用後のエンコーダ位置の1周期差分。
    pub(crate) fn isr_do_sense(&mut self, data: &mut CommandData) -> i16 {
        let currents = self.adc.finish_currents();

        // 変換完了時点でゲートモニタがハイなら、電流サンプリング窓を
        // 食い潰すデューティで走っていたということ。そのサイクルの値は
        // 信用できないので即フォルト。
        if self.status.mode != Mode::Fault && self.pwm.any_output_high() {
            self.status.mode = Mode::Fault;
            self.status.fault = ErrorCode::PwmCycleOverrun;
            warn!("pwm cycle overrun: gate opened before conversion finished");
        }

        // SPIトランザクションを走らせている間に他の仕事を進める
        self.encoder.start_sample();

        if let Some(rezero) = data.rezero_position.take() {
            self.status.position_to_set = rezero;
            self.status.rezeroed = true;
        }

        // timeout_sはワンショット：取り込んだらスロット側は0にして、
        // 同じコマンドの再読みでウォッチドッグが巻き戻らないようにする
        if data.timeout_s.is_nan() || data.timeout_s != 0.0 {
            self.status.timeout_s = data.timeout_s;
            data.timeout_s = 0.0;
        }

        self.status.adc_cur1_raw = currents[0];
        self.status.adc_cur2_raw = currents[1];
        self.status.adc_cur3_raw = currents[2];

        let aux = self.adc.finish_aux();
        self.status.adc_voltage_sense_raw = aux.voltage_raw;
        match self.aux_channel {
            TempChannel::Fet => self.status.adc_fet_temp_raw = aux.temp_raw,
            TempChannel::Motor => self.status.adc_motor_temp_raw = aux.temp_raw,
        }

        // 温度2チャネルは1本の変換器を周期ごとに交互に使う
        self.aux_channel = match self.aux_channel {
            TempChannel::Fet => TempChannel::Motor,
            TempChannel::Motor => TempChannel::Fet,
        };
        self.adc.select_temp_channel(self.aux_channel);

        let old_position = self.status.position;
        self.status.position_raw = self.encoder.finish_sample();
        self.status.position = if self.motor.invert {
            self.status.position_raw.wrapping_neg()
        } else {
            self.status.position_raw
        };

        let delta_position = self.status.position.wrapping_sub(old_position) as i16;

        // 物理的にあり得ない位置ジャンプは読み取りエラー
        if self.status.mode != Mode::Stopped
            && self.status.mode != Mode::Fault
            && (delta_position as i32).abs() > MAX_POSITION_DELTA as i32
        {
            self.status.mode = Mode::Fault;
            self.status.fault = ErrorCode::EncoderFault;
            warn!("encoder fault: delta {} counts in one cycle", delta_position);
        }

        delta_position
    }
}
