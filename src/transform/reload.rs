use crate::error::TransformError;
use crate::file::File;

use super::{FileTransform, StepContext};

pub(super) const NAME: &str = "live-reload";

/// Injects the live-reload client into HTML pages while watching.
pub struct LiveReload;

impl LiveReload {
    /// Insert `script` before the last `</body>`, or append it when the page
    /// has none (optional tags may have been removed).
    pub fn inject(html: &str, script: &str) -> String {
        let tag = format!("<script>{script}</script>");

        let lower = html.to_ascii_lowercase();
        match lower.rfind("</body>") {
            Some(index) => {
                let mut out = String::with_capacity(html.len() + tag.len());
                out.push_str(&html[..index]);
                out.push_str(&tag);
                out.push_str(&html[index..]);
                out
            }
            None => format!("{html}{tag}"),
        }
    }
}

impl FileTransform for LiveReload {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(&self, ctx: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
        if !matches!(file.extension(), Some("html" | "htm")) {
            return Ok(Some(file));
        }

        if let Some(script) = ctx.env.refresh_script() {
            let html = Self::inject(file.text(NAME)?, &script);
            file.replace(html, None);
        }

        Ok(Some(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Environment, Mode};

    #[test]
    fn inserts_before_body_end() {
        let out = LiveReload::inject("<p>x</p></BODY></html>", "go()");
        assert_eq!(out, "<p>x</p><script>go()</script></BODY></html>");
    }

    #[test]
    fn appends_without_body() {
        assert_eq!(LiveReload::inject("<p>x", "go()"), "<p>x<script>go()</script>");
    }

    #[test]
    fn only_in_watch_mode() {
        let file = || File::new("/p/app", "index.html", "<p>x</p>");

        let env = Environment::new("/p", Mode::Build).with_reload_port(35729);
        let out = LiveReload.transform(&StepContext { env: &env }, file()).unwrap().unwrap();
        assert_eq!(out.contents, b"<p>x</p>");

        let env = Environment::new("/p", Mode::Watch).with_reload_port(35729);
        let out = LiveReload.transform(&StepContext { env: &env }, file()).unwrap().unwrap();
        let html = String::from_utf8(out.contents).unwrap();
        assert!(html.contains("ws://"));
        assert!(html.contains("35729"));
    }
}
