//! Filter graph construction for the mix
//!
//! Input 0 is the looped music, input 1 the voice. Gain is applied once,
//! as explicit `amix` weights with normalization off, so a 0.85 voice weight
//! yields 0.85× the voice's own level in the output.

use super::MixParams;

/// `offset + voice + tail`, in seconds
pub fn target_seconds(params: &MixParams, voice_seconds: f64) -> f64 {
    params.offset_ms as f64 / 1000.0 + voice_seconds + params.tail_ms as f64 / 1000.0
}

/// Build the `-filter_complex` graph producing `[aout]`
pub fn build_filter_graph(params: &MixParams, target_seconds: f64) -> String {
    let fade = if params.fade_out {
        let fade_secs = params.fade_ms as f64 / 1000.0;
        let fade_start = (target_seconds - fade_secs).max(0.0);
        format!(",afade=t=out:st={:.6}:d={:.6}", fade_start, fade_secs)
    } else {
        String::new()
    };

    format!(
        "[1:a]adelay={offset}|{offset}[v];\
         [0:a][v]amix=inputs=2:weights={music:.3} {voice:.3}:normalize=0:duration=longest:dropout_transition=3[mix];\
         [mix]atrim=0:{target:.6},asetpts=PTS-STARTPTS{fade}[aout]",
        offset = params.offset_ms,
        music = params.music_volume,
        voice = params.voice_volume,
        target = target_seconds,
        fade = fade,
    )
}
