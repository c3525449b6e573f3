//! Starter content shown on a fresh page.

pub const HTML: &str = r#"<div class="container">
  <h1>Welcome to Code Playground</h1>
  <p>Edit the HTML, CSS, and JavaScript to see your changes in real-time!</p>
  <button id="demo-button">Click Me!</button>
  <div id="output"></div>
</div>"#;

pub const CSS: &str = r#"body {
  font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif;
  line-height: 1.6;
  margin: 0;
  padding: 20px;
  background-color: #f5f5f5;
}

.container {
  max-width: 800px;
  margin: 0 auto;
  padding: 20px;
  background-color: white;
  border-radius: 8px;
  box-shadow: 0 2px 10px rgba(0, 0, 0, 0.1);
}

h1 {
  color: #333;
  border-bottom: 2px solid #eee;
  padding-bottom: 10px;
}

button {
  background-color: #4CAF50;
  color: white;
  border: none;
  padding: 10px 15px;
  border-radius: 4px;
  cursor: pointer;
  font-size: 16px;
  transition: background-color 0.3s;
}

button:hover {
  background-color: #45a049;
}

#output {
  margin-top: 20px;
  padding: 15px;
  border: 1px solid #ddd;
  border-radius: 4px;
  min-height: 50px;
}"#;

pub const JS: &str = r#"const button = document.getElementById('demo-button');
const output = document.getElementById('output');

button.addEventListener('click', () => {
  console.log('Button clicked!');

  output.innerHTML = '<p>Button was clicked at: ' + new Date().toLocaleTimeString() + '</p>';

  const randomColor = '#' + Math.floor(Math.random()*16777215).toString(16);
  button.style.backgroundColor = randomColor;
});

console.log('Page loaded successfully!');"#;
