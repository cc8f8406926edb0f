use crate::track::Track;

/// The tracks being played and the position in them
#[derive(Debug, Default)]
pub struct Queue {
    playlist_id: String,
    tracks: Vec<Track>,
    current: Option<usize>,
    repeat: bool,
}

impl Queue {
    pub fn new(repeat: bool) -> Self {
        Self {
            playlist_id: "library".to_string(),
            repeat,
            ..Self::default()
        }
    }

    pub fn load(&mut self, playlist_id: &str, tracks: Vec<Track>) {
        self.playlist_id = playlist_id.to_string();
        self.tracks = tracks;
        self.current = None;
    }

    pub fn playlist_id(&self) -> &str {
        &self.playlist_id
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Track> {
        self.tracks.get_mut(index)
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn set_current(&mut self, index: Option<usize>) {
        self.current = index.filter(|i| *i < self.tracks.len());
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    /// First playable index at or after `start`, wrapping to the top when
    /// repeat is on
    pub fn next_playable_from(&self, start: usize) -> Option<usize> {
        let forward = (start..self.tracks.len()).find(|i| !self.tracks[*i].unavailable);
        if forward.is_some() || !self.repeat {
            return forward;
        }
        (0..start.min(self.tracks.len())).find(|i| !self.tracks[*i].unavailable)
    }

    /// Candidate for an automatic crossfade out of the current track
    pub fn next_for_crossfade(&self) -> Option<usize> {
        let current = self.current?;
        self.next_playable_from(current + 1)
            .filter(|next| *next != current || self.repeat)
    }

    pub fn mark_unavailable(&mut self, index: usize) -> Option<&Track> {
        let track = self.tracks.get_mut(index)?;
        track.unavailable = true;
        Some(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(unavailable: &[usize], repeat: bool) -> Queue {
        let mut queue = Queue::new(repeat);
        let tracks = (0..4)
            .map(|i| {
                let mut track = Track::new(&format!("Song {}", i), &["Artist"]);
                track.unavailable = unavailable.contains(&i);
                track
            })
            .collect();
        queue.load("mix", tracks);
        queue
    }

    #[test]
    fn test_next_playable_skips_unavailable() {
        let q = queue(&[1, 2], false);
        assert_eq!(q.next_playable_from(1), Some(3));
        assert_eq!(q.next_playable_from(4), None);
    }

    #[test]
    fn test_next_playable_wraps_with_repeat() {
        let q = queue(&[0], true);
        assert_eq!(q.next_playable_from(4), Some(1));
        let q = queue(&[0, 1, 2, 3], true);
        assert_eq!(q.next_playable_from(2), None);
    }

    #[test]
    fn test_crossfade_candidate() {
        let mut q = queue(&[], false);
        assert_eq!(q.next_for_crossfade(), None);
        q.set_current(Some(2));
        assert_eq!(q.next_for_crossfade(), Some(3));
        q.set_current(Some(3));
        assert_eq!(q.next_for_crossfade(), None);
        q.set_repeat(true);
        assert_eq!(q.next_for_crossfade(), Some(0));
    }

    #[test]
    fn test_set_current_out_of_range() {
        let mut q = queue(&[], false);
        q.set_current(Some(9));
        assert_eq!(q.current(), None);
    }
}
