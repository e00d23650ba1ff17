mod content_tag;
