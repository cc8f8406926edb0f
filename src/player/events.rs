/// Notifications for whatever presents the player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    NowPlayingChanged { index: usize, name: String, artists: String },
    LoadingChanged { index: usize, loading: bool },
    TrackUnavailable { index: usize, name: String },
    PlaybackStateChanged { playing: bool },
    SlowConnection { buffered_ms: u64 },
    CrossfadeStarted { from: Option<usize>, to: usize },
    QueueFinished,
}
